#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schema for the froth monitor and controller.
//!
//! Every table is optional; a missing table or key falls back to the
//! defaults below. `Config::validate` checks ranges and reports the first
//! offending key as `table.key`.
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CameraBackend {
    /// Synthetic frames (no device required)
    #[default]
    Sim,
    /// Replay still images from `camera.path`
    File,
    /// Live V4L2 capture from `camera.device` (needs the `v4l2` feature)
    Device,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CameraCfg {
    pub backend: CameraBackend,
    /// Image file or directory for the `file` backend
    pub path: Option<String>,
    /// Device node for the `device` backend
    pub device: String,
    pub width: u32,
    pub height: u32,
    /// Requested capture rate for the `device` backend
    pub fps: u32,
    /// Bubble count per synthetic frame (sim backend)
    pub sim_bubbles: usize,
    /// Per-frame read timeout
    pub read_timeout_ms: u64,
    /// Open attempts before giving up
    pub max_retries: u32,
    /// Pause between open attempts
    pub retry_backoff_ms: u64,
}

impl Default for CameraCfg {
    fn default() -> Self {
        Self {
            backend: CameraBackend::Sim,
            path: None,
            device: "/dev/video0".into(),
            width: 640,
            height: 480,
            fps: 30,
            sim_bubbles: 60,
            read_timeout_ms: 200,
            max_retries: 5,
            retry_backoff_ms: 2000,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PreprocessCfg {
    /// Gaussian kernel size in pixels; <= 1 disables blurring
    pub blur_kernel: u32,
    /// Square structuring element size for opening/closing
    pub morph_kernel: u32,
    pub opening_iterations: u32,
    pub closing_iterations: u32,
    /// Dark bubbles on a bright background need the inverted threshold
    pub invert: bool,
}

impl Default for PreprocessCfg {
    fn default() -> Self {
        Self {
            blur_kernel: 1,
            morph_kernel: 1,
            opening_iterations: 2,
            closing_iterations: 4,
            invert: true,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DetectorCfg {
    /// Minimum contour area in pixels²
    pub min_area: f64,
    /// Seed threshold as a fraction of the peak distance
    pub distance_threshold: f32,
    pub circularity_threshold: f64,
    pub dilation_iterations: u32,
    /// Square element size for the sure-background dilation; 1 disables it
    pub background_kernel: u32,
}

impl Default for DetectorCfg {
    fn default() -> Self {
        Self {
            min_area: 80.0,
            distance_threshold: 0.125,
            circularity_threshold: 0.45,
            dilation_iterations: 3,
            background_kernel: 3,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AnalyzerCfg {
    /// Ring buffer length for the temporal metrics
    pub history: usize,
    pub density_low: f64,
    pub density_high: f64,
    pub density_floor: f64,
    pub weight_uniformity: f64,
    pub weight_consistency: f64,
    pub weight_density: f64,
    /// Consistency score used until three samples are available
    pub neutral_consistency: f64,
}

impl Default for AnalyzerCfg {
    fn default() -> Self {
        Self {
            history: 10,
            density_low: 50.0,
            density_high: 200.0,
            density_floor: 0.5,
            weight_uniformity: 0.4,
            weight_consistency: 0.4,
            weight_density: 0.2,
            neutral_consistency: 0.5,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Auto,
    Manual,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControlCfg {
    pub mode: Mode,
    /// Target bubble count
    pub setpoint: f64,
    pub kp: f64,
    pub ki: f64,
    /// Frother duty used in manual mode
    pub manual_duty: f64,
    pub integral_limit: f64,
    pub rate_hz: f64,
}

impl Default for ControlCfg {
    fn default() -> Self {
        Self {
            mode: Mode::Auto,
            setpoint: 120.0,
            kp: 0.5,
            ki: 0.05,
            manual_duty: 0.0,
            integral_limit: 50.0,
            rate_hz: 1.0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SenseCfg {
    pub rate_hz: f64,
    /// Draw detected bubbles on the streamed frames
    pub annotate: bool,
}

impl Default for SenseCfg {
    fn default() -> Self {
        Self {
            rate_hz: 10.0,
            annotate: true,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SafetyCfg {
    /// Heartbeat age that trips the emergency stop
    pub watchdog_timeout_ms: u64,
}

impl Default for SafetyCfg {
    fn default() -> Self {
        Self {
            watchdog_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Pins {
    pub frother: u8,
    pub agitator: u8,
    pub air_pump: u8,
    pub feed_pump: u8,
    pub pwm_frequency_hz: u32,
}

impl Default for Pins {
    fn default() -> Self {
        Self {
            frother: 12,
            agitator: 13,
            air_pump: 14,
            feed_pump: 15,
            pwm_frequency_hz: 1000,
        }
    }
}

/// Initial duty for the channels the controller does not drive.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DevicesCfg {
    pub agitator: f64,
    pub air_pump: f64,
    pub feed_pump: f64,
}

impl Default for DevicesCfg {
    fn default() -> Self {
        Self {
            agitator: 50.0,
            air_pump: 50.0,
            feed_pump: 50.0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct QueuesCfg {
    pub frame_capacity: usize,
    pub metrics_capacity: usize,
    pub sink_capacity: usize,
}

impl Default for QueuesCfg {
    fn default() -> Self {
        Self {
            frame_capacity: 1,
            metrics_capacity: 100,
            sink_capacity: 100,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub camera: CameraCfg,
    pub preprocess: PreprocessCfg,
    pub detector: DetectorCfg,
    pub analyzer: AnalyzerCfg,
    pub control: ControlCfg,
    pub sense: SenseCfg,
    pub safety: SafetyCfg,
    pub pins: Pins,
    pub devices: DevicesCfg,
    pub queues: QueuesCfg,
    pub logging: Logging,
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

fn in_range(v: f64, lo: f64, hi: f64) -> bool {
    v.is_finite() && (lo..=hi).contains(&v)
}

impl Config {
    pub fn validate(&self) -> eyre::Result<()> {
        // Camera
        if self.camera.width == 0 || self.camera.height == 0 {
            eyre::bail!("camera.width and camera.height must be > 0");
        }
        if self.camera.backend == CameraBackend::File && self.camera.path.is_none() {
            eyre::bail!("camera.path is required when camera.backend = \"file\"");
        }
        if self.camera.backend == CameraBackend::Device {
            if self.camera.device.trim().is_empty() {
                eyre::bail!("camera.device is required when camera.backend = \"device\"");
            }
            if self.camera.width % 2 != 0 {
                eyre::bail!("camera.width must be even for device capture");
            }
        }
        if !(1..=120).contains(&self.camera.fps) {
            eyre::bail!("camera.fps must be in [1, 120]");
        }
        if self.camera.read_timeout_ms == 0 {
            eyre::bail!("camera.read_timeout_ms must be >= 1");
        }
        if self.camera.max_retries == 0 {
            eyre::bail!("camera.max_retries must be >= 1");
        }
        if self.camera.retry_backoff_ms > 60_000 {
            eyre::bail!("camera.retry_backoff_ms is unreasonably large (>60s)");
        }

        // Preprocess
        if self.preprocess.blur_kernel > 1 && self.preprocess.blur_kernel % 2 == 0 {
            eyre::bail!("preprocess.blur_kernel must be odd");
        }
        if self.preprocess.morph_kernel == 0 || self.preprocess.morph_kernel % 2 == 0 {
            eyre::bail!("preprocess.morph_kernel must be odd and >= 1");
        }
        if self.preprocess.morph_kernel > 31 {
            eyre::bail!("preprocess.morph_kernel must be <= 31");
        }

        // Detector
        if !(self.detector.min_area.is_finite() && self.detector.min_area >= 0.0) {
            eyre::bail!("detector.min_area must be >= 0");
        }
        let dt = self.detector.distance_threshold;
        if !(dt.is_finite() && dt > 0.0 && dt < 1.0) {
            eyre::bail!("detector.distance_threshold must be in (0.0, 1.0)");
        }
        if !in_range(self.detector.circularity_threshold, 0.0, 1.0) {
            eyre::bail!("detector.circularity_threshold must be in [0.0, 1.0]");
        }
        let bk = self.detector.background_kernel;
        if bk == 0 || bk % 2 == 0 || bk > 31 {
            eyre::bail!("detector.background_kernel must be odd and in [1, 31]");
        }

        // Analyzer
        let a = &self.analyzer;
        if a.history == 0 {
            eyre::bail!("analyzer.history must be >= 1");
        }
        if !(a.density_low.is_finite() && a.density_low > 0.0) {
            eyre::bail!("analyzer.density_low must be > 0");
        }
        if !(a.density_high.is_finite() && a.density_high >= a.density_low) {
            eyre::bail!("analyzer.density_high must be >= analyzer.density_low");
        }
        if !in_range(a.density_floor, 0.0, 1.0) {
            eyre::bail!("analyzer.density_floor must be in [0.0, 1.0]");
        }
        for (key, w) in [
            ("weight_uniformity", a.weight_uniformity),
            ("weight_consistency", a.weight_consistency),
            ("weight_density", a.weight_density),
        ] {
            if !in_range(w, 0.0, 1.0) {
                eyre::bail!("analyzer.{key} must be in [0.0, 1.0]");
            }
        }
        if !in_range(a.neutral_consistency, 0.0, 1.0) {
            eyre::bail!("analyzer.neutral_consistency must be in [0.0, 1.0]");
        }

        // Control
        let c = &self.control;
        if !in_range(c.setpoint, 0.0, 500.0) {
            eyre::bail!("control.setpoint must be in [0, 500]");
        }
        if !in_range(c.kp, 0.0, 10.0) {
            eyre::bail!("control.kp must be in [0.0, 10.0]");
        }
        if !in_range(c.ki, 0.0, 1.0) {
            eyre::bail!("control.ki must be in [0.0, 1.0]");
        }
        if !in_range(c.manual_duty, 0.0, 100.0) {
            eyre::bail!("control.manual_duty must be in [0, 100]");
        }
        if !(c.integral_limit.is_finite() && c.integral_limit > 0.0) {
            eyre::bail!("control.integral_limit must be > 0");
        }
        if !in_range(c.rate_hz, 0.01, 100.0) {
            eyre::bail!("control.rate_hz must be in [0.01, 100]");
        }

        // Sense
        if !in_range(self.sense.rate_hz, 0.1, 120.0) {
            eyre::bail!("sense.rate_hz must be in [0.1, 120]");
        }

        // Safety
        if self.safety.watchdog_timeout_ms == 0 {
            eyre::bail!("safety.watchdog_timeout_ms must be >= 1");
        }
        let control_period_ms = 1000.0 / c.rate_hz;
        if (self.safety.watchdog_timeout_ms as f64) <= control_period_ms {
            eyre::bail!("safety.watchdog_timeout_ms must exceed the control period");
        }

        // Pins
        let p = &self.pins;
        let mut pins = [p.frother, p.agitator, p.air_pump, p.feed_pump];
        pins.sort_unstable();
        if pins.windows(2).any(|w| w[0] == w[1]) {
            eyre::bail!("pins.* must be distinct");
        }
        if p.pwm_frequency_hz == 0 {
            eyre::bail!("pins.pwm_frequency_hz must be > 0");
        }

        // Devices
        for (key, d) in [
            ("agitator", self.devices.agitator),
            ("air_pump", self.devices.air_pump),
            ("feed_pump", self.devices.feed_pump),
        ] {
            if !in_range(d, 0.0, 100.0) {
                eyre::bail!("devices.{key} must be in [0, 100]");
            }
        }

        // Queues
        if self.queues.frame_capacity == 0 {
            eyre::bail!("queues.frame_capacity must be >= 1");
        }
        if self.queues.metrics_capacity == 0 {
            eyre::bail!("queues.metrics_capacity must be >= 1");
        }
        if self.queues.sink_capacity == 0 {
            eyre::bail!("queues.sink_capacity must be >= 1");
        }

        // Logging
        if let Some(r) = self.logging.rotation.as_deref()
            && !matches!(r, "never" | "daily" | "hourly")
        {
            eyre::bail!("logging.rotation must be one of never|daily|hourly");
        }

        Ok(())
    }
}

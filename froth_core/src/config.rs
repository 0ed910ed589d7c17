//! Runtime configuration types for the pipeline stages.
//!
//! These are separate from the TOML-deserialized config in `froth_config`;
//! see `conversions` for the mapping.

use std::time::Duration;

use crate::actuator::DeviceState;
use crate::state::Mode;

/// Frame source retry and timeout policy.
#[derive(Debug, Clone)]
pub struct SourceCfg {
    /// Per-read wait handed to the camera.
    pub read_timeout: Duration,
    /// Open attempts (each attempt opens and reads a test frame).
    pub max_retries: u32,
    /// Pause between open attempts.
    pub retry_backoff: Duration,
}

impl Default for SourceCfg {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(200),
            max_retries: 5,
            retry_backoff: Duration::from_secs(2),
        }
    }
}

/// Preprocessing pipeline knobs.
#[derive(Debug, Clone)]
pub struct PreprocessCfg {
    /// Gaussian kernel size in pixels; <= 1 disables blurring.
    pub blur_kernel: u32,
    /// Square structuring element size (odd).
    pub morph_kernel: u32,
    pub opening_iterations: u32,
    pub closing_iterations: u32,
    /// Foreground is darker than the threshold when set.
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

/// Blob detector thresholds.
#[derive(Debug, Clone)]
pub struct DetectorCfg {
    /// Minimum contour area in pixels².
    pub min_area: f64,
    /// Seed threshold as a fraction of the peak distance.
    pub distance_threshold: f32,
    /// Minimum `4πA/P²`.
    pub circularity_threshold: f64,
    /// Dilations used to build the sure-background region.
    pub dilation_iterations: u32,
    /// Side of the square element for those dilations; odd, 1 is a no-op.
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

/// Hand-tuned constants of the stability score.
#[derive(Debug, Clone, PartialEq)]
pub struct StabilityWeights {
    /// Density ramps from 0 up to 1 below this count.
    pub density_low: f64,
    /// Density decays above this count.
    pub density_high: f64,
    /// Lowest density score reached by the decay.
    pub density_floor: f64,
    pub uniformity: f64,
    pub consistency: f64,
    pub density: f64,
    /// Consistency used until the history holds three samples.
    pub neutral_consistency: f64,
}

impl Default for StabilityWeights {
    fn default() -> Self {
        Self {
            density_low: 50.0,
            density_high: 200.0,
            density_floor: 0.5,
            uniformity: 0.4,
            consistency: 0.4,
            density: 0.2,
            neutral_consistency: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalyzerCfg {
    /// Ring buffer capacity.
    pub history: usize,
    pub weights: StabilityWeights,
}

impl Default for AnalyzerCfg {
    fn default() -> Self {
        Self {
            history: 10,
            weights: StabilityWeights::default(),
        }
    }
}

/// GPIO pin per actuator channel.
#[derive(Debug, Clone)]
pub struct ChannelPins {
    pub frother: u8,
    pub agitator: u8,
    pub air_pump: u8,
    pub feed_pump: u8,
    pub frequency_hz: u32,
}

impl Default for ChannelPins {
    fn default() -> Self {
        Self {
            frother: 12,
            agitator: 13,
            air_pump: 14,
            feed_pump: 15,
            frequency_hz: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SafetyCfg {
    /// Heartbeat age that trips the emergency stop.
    pub watchdog_timeout: Duration,
}

impl Default for SafetyCfg {
    fn default() -> Self {
        Self {
            watchdog_timeout: Duration::from_secs(5),
        }
    }
}

/// Initial controller parameters.
#[derive(Debug, Clone)]
pub struct ControlCfg {
    pub mode: Mode,
    pub setpoint: f64,
    pub kp: f64,
    pub ki: f64,
    pub manual_duty: f64,
    pub integral_limit: f64,
    /// Requested duty for the channels the controller does not drive.
    pub devices: DeviceState,
}

impl Default for ControlCfg {
    fn default() -> Self {
        Self {
            mode: Mode::Auto,
            setpoint: 120.0,
            kp: 0.5,
            ki: 0.05,
            manual_duty: 0.0,
            integral_limit: crate::pi::INTEGRAL_LIMIT,
            devices: DeviceState::auxiliaries(50.0),
        }
    }
}

/// Loop rates and queue sizes.
#[derive(Debug, Clone)]
pub struct PipelineCfg {
    pub sense_rate_hz: f64,
    pub control_rate_hz: f64,
    pub frame_capacity: usize,
    pub metrics_capacity: usize,
    pub sink_capacity: usize,
    /// Stream annotated frames instead of raw ones.
    pub annotate_frames: bool,
}

impl Default for PipelineCfg {
    fn default() -> Self {
        Self {
            sense_rate_hz: 10.0,
            control_rate_hz: 1.0,
            frame_capacity: 1,
            metrics_capacity: 100,
            sink_capacity: 100,
            annotate_frames: true,
        }
    }
}

/// Everything the pipeline needs, grouped per stage.
#[derive(Debug, Clone, Default)]
pub struct FrothCfg {
    pub source: SourceCfg,
    pub preprocess: PreprocessCfg,
    pub detector: DetectorCfg,
    pub analyzer: AnalyzerCfg,
    pub pins: ChannelPins,
    pub safety: SafetyCfg,
    pub control: ControlCfg,
    pub pipeline: PipelineCfg,
}

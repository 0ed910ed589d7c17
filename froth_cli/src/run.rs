//! Command bodies: backend assembly, the long-running `run`, one-shot
//! `analyze` and `self-check`.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use eyre::{Result, WrapErr};
use froth_config::{CameraBackend, Config};
use froth_core::pipeline::{DynBus, DynCamera};
use froth_core::{
    ActuatorDriver, BlobDetector, FrameSource, FrothAnalyzer, FrothCfg, FrothError, FrothMetrics,
    Pipeline, Preprocessor, SharedSnapshot,
};
use froth_hardware::{ImageFileCamera, SimulatedCamera};
use froth_segment::ImageprocSegmentation;
use serde_json::{Value, json};

use crate::error_fmt::CliError;

/// Poll interval of the foreground wait in `run`.
const WAIT_TICK: Duration = Duration::from_millis(50);

/// Overrides from the `run` subcommand.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunArgs {
    pub duration: Option<Duration>,
    pub mode: Option<froth_core::Mode>,
    pub setpoint: Option<f64>,
}

// ── Backends ─────────────────────────────────────────────────────────────────

pub fn make_camera(cfg: &Config) -> Result<DynCamera> {
    let camera: DynCamera = match cfg.camera.backend {
        CameraBackend::Sim => {
            let cam = SimulatedCamera::new(cfg.camera.width, cfg.camera.height, cfg.camera.sim_bubbles);
            // Test knob: make every open fail
            if std::env::var("FROTH_TEST_SIM_CAMERA_FAIL").is_ok_and(|v| v == "1") {
                tracing::warn!("FROTH_TEST_SIM_CAMERA_FAIL set; simulated camera will not open");
                cam.faults().set_fail_open(true);
            }
            Box::new(cam)
        }
        CameraBackend::File => {
            let path = cfg.camera.path.as_deref().unwrap_or(".");
            Box::new(ImageFileCamera::new(path))
        }
        CameraBackend::Device => device_camera(cfg)?,
    };
    Ok(camera)
}

#[cfg(all(feature = "v4l2", target_os = "linux"))]
fn device_camera(cfg: &Config) -> Result<DynCamera> {
    let c = &cfg.camera;
    Ok(Box::new(froth_hardware::V4l2Camera::new(
        c.device.as_str(),
        c.width,
        c.height,
        c.fps,
    )))
}

#[cfg(not(all(feature = "v4l2", target_os = "linux")))]
fn device_camera(_cfg: &Config) -> Result<DynCamera> {
    Err(eyre::Report::new(CliError::BackendUnavailable {
        backend: "device",
        feature: "v4l2",
    }))
}

pub fn make_bus() -> Result<DynBus> {
    #[cfg(all(feature = "hardware", target_os = "linux"))]
    {
        let bus = froth_hardware::RppalPwm::new().wrap_err("open gpio for pwm")?;
        Ok(Box::new(bus))
    }
    #[cfg(not(all(feature = "hardware", target_os = "linux")))]
    {
        Ok(Box::new(froth_hardware::SimulatedPwm::new()))
    }
}

// ── run ──────────────────────────────────────────────────────────────────────

/// Start the pipeline and wait for Ctrl-C or the duration. Returns the
/// final snapshot; an emergency stop still latched at the end is an error.
pub fn run_pipeline(
    cfg: &Config,
    args: RunArgs,
    shutdown: Arc<AtomicBool>,
) -> Result<SharedSnapshot> {
    let mut core_cfg = FrothCfg::from(cfg);
    if let Some(mode) = args.mode {
        core_cfg.control.mode = mode;
    }
    if let Some(sp) = args.setpoint {
        if !(sp.is_finite() && (0.0..=500.0).contains(&sp)) {
            return Err(eyre::Report::new(FrothError::from(
                froth_core::ControlError::OutOfRange {
                    field: "setpoint",
                    value: sp,
                    min: 0.0,
                    max: 500.0,
                },
            )));
        }
        core_cfg.control.setpoint = sp;
    }

    let mut pipeline = Pipeline::builder()
        .with_config(core_cfg)
        .with_camera(make_camera(cfg)?)
        .with_bus(make_bus()?)
        .with_segmentation(ImageprocSegmentation::new())
        .start()?;
    let handle = pipeline.handle();
    tracing::info!(
        mode = %handle.control_state().mode,
        setpoint = handle.control_state().setpoint,
        duration_s = args.duration.map(|d| d.as_secs_f64()),
        "pipeline running"
    );

    let started = Instant::now();
    loop {
        if shutdown.load(Ordering::Relaxed) {
            tracing::info!("interrupt received");
            break;
        }
        if args.duration.is_some_and(|d| started.elapsed() >= d) {
            break;
        }
        std::thread::sleep(WAIT_TICK);
    }

    let failed = pipeline.shutdown();
    if !failed.is_empty() {
        tracing::error!(?failed, "channels could not be zeroed at shutdown");
    }
    let snap = handle.snapshot();
    if snap.safety.estop_active {
        return Err(eyre::Report::new(CliError::EstopLatched(snap.safety.estop_reason)));
    }
    Ok(snap)
}

// ── analyze ──────────────────────────────────────────────────────────────────

pub fn analyze_image(cfg: &Config, path: &Path) -> Result<FrothMetrics> {
    let img = image::open(path).map_err(|e| CliError::Image {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let core_cfg = FrothCfg::from(cfg);
    let mut analyzer = FrothAnalyzer::new(
        Preprocessor::new(core_cfg.preprocess),
        BlobDetector::new(ImageprocSegmentation::new(), core_cfg.detector),
        core_cfg.analyzer,
    );
    let analysis = analyzer.analyze_frame(&img.to_rgb8(), 1);
    tracing::debug!(
        blobs = analysis.detection.blobs.len(),
        "image analysed"
    );
    Ok(analysis.metrics)
}

// ── self-check ───────────────────────────────────────────────────────────────

/// What `self-check` saw before shutting everything down.
#[derive(Debug, Clone, Copy)]
pub struct SelfCheck {
    pub frame_width: u32,
    pub frame_height: u32,
    pub channels: usize,
}

pub fn self_check(cfg: &Config) -> Result<SelfCheck> {
    let core_cfg = FrothCfg::from(cfg);
    let mut source = FrameSource::new(make_camera(cfg)?, core_cfg.source);
    source
        .open()
        .map_err(FrothError::from)
        .wrap_err("opening camera")?;
    let frame = source.read().map_err(FrothError::from);
    let started = ActuatorDriver::start(make_bus()?, core_cfg.pins).map_err(FrothError::from);
    let mut driver = match started {
        Ok(d) => d,
        Err(e) => {
            source.release();
            return Err(eyre::Report::new(e).wrap_err("starting actuators"));
        }
    };
    let channels = driver.device_state().iter().count();
    let failed = driver.shutdown();
    source.release();
    let frame = frame.wrap_err("reading test frame")?;
    if !failed.is_empty() {
        eyre::bail!("channels could not be zeroed: {failed:?}");
    }
    Ok(SelfCheck {
        frame_width: frame.image.width(),
        frame_height: frame.image.height(),
        channels,
    })
}

// ── Output ───────────────────────────────────────────────────────────────────

fn epoch_secs(t: SystemTime) -> f64 {
    t.duration_since(UNIX_EPOCH).map_or(0.0, |d| d.as_secs_f64())
}

pub fn metrics_json(m: &FrothMetrics) -> Value {
    json!({
        "seq": m.seq,
        "timestamp": epoch_secs(m.timestamp),
        "bubble_count": m.bubble_count,
        "avg_bubble_size": m.avg_bubble_size,
        "avg_diameter": m.avg_diameter,
        "size_std_dev": m.size_std_dev,
        "min_diameter": m.min_diameter,
        "max_diameter": m.max_diameter,
        "avg_circularity": m.avg_circularity,
        "coverage_ratio": m.coverage_ratio,
        "froth_stability": m.froth_stability,
        "temporal_variance": m.temporal_variance,
        "anomaly_detected": m.anomaly_detected,
    })
}

pub fn snapshot_json(s: &SharedSnapshot) -> Value {
    let now = Instant::now();
    let age_ms = |t: Instant| now.saturating_duration_since(t).as_millis() as u64;
    let devices: serde_json::Map<String, Value> = s
        .devices
        .iter()
        .map(|(ch, duty)| (ch.name().to_string(), json!(duty)))
        .collect();
    json!({
        "metrics": s.metrics.as_ref().map(metrics_json),
        "control": {
            "mode": s.control.mode.as_str(),
            "setpoint": s.control.setpoint,
            "kp": s.control.kp,
            "ki": s.control.ki,
            "integral": s.control.integral,
            "manual_duty_cycle": s.control.manual_duty_cycle,
        },
        "devices": devices,
        "safety": {
            "estop_active": s.safety.estop_active,
            "estop_reason": s.safety.estop_reason.map(|r| r.as_str()),
            "sense_heartbeat_age_ms": age_ms(s.safety.last_sense_heartbeat),
            "control_heartbeat_age_ms": age_ms(s.safety.last_control_heartbeat),
        },
        "sense_healthy": s.sense_healthy,
        "frame_rate": s.frame_rate,
    })
}

pub fn print_metrics(m: &FrothMetrics) {
    println!("bubbles: {}", m.bubble_count);
    println!(
        "diameter (px): avg {:.1} min {:.1} max {:.1} sd {:.1}",
        m.avg_diameter, m.min_diameter, m.max_diameter, m.size_std_dev
    );
    println!("circularity: {:.2}", m.avg_circularity);
    println!("coverage: {:.1}%", m.coverage_ratio * 100.0);
    println!("stability: {:.2}", m.froth_stability);
}

pub fn print_snapshot(s: &SharedSnapshot) {
    match &s.metrics {
        Some(m) => print_metrics(m),
        None => println!("no metrics yet"),
    }
    println!(
        "control: {} setpoint {:.0} kp {} ki {} integral {:.2}",
        s.control.mode, s.control.setpoint, s.control.kp, s.control.ki, s.control.integral
    );
    let duties: Vec<String> = s
        .devices
        .iter()
        .map(|(ch, d)| format!("{ch}={d:.0}%"))
        .collect();
    println!("devices: {}", duties.join(" "));
    println!("frame rate: {:.1} Hz", s.frame_rate);
}

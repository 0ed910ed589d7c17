//! Human-readable error descriptions and structured JSON error formatting.

use froth_core::error::{AcquisitionError, BuildError, ControlError, FrothError, StartupError};
use froth_core::EstopReason;

/// Failures raised by the CLI itself rather than by the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("invalid configuration in {path}: {reason}")]
    Config { path: String, reason: String },
    #[error("could not load image {path}: {reason}")]
    Image { path: String, reason: String },
    #[error("run ended with the emergency stop latched ({})", reason_name(.0))]
    EstopLatched(Option<EstopReason>),
    #[error("camera backend `{backend}` is not built in (enable feature `{feature}`)")]
    BackendUnavailable {
        backend: &'static str,
        feature: &'static str,
    },
}

fn reason_name(r: &Option<EstopReason>) -> &'static str {
    r.map_or("unknown", EstopReason::as_str)
}

/// Map an eyre::Report to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    // Typed matches first
    if let Some(ce) = err.downcast_ref::<CliError>() {
        return match ce {
            CliError::Config { path, reason } => format!(
                "What happened: Configuration is invalid ({reason}).\nLikely causes: Out-of-range or mistyped value in {path}.\nHow to fix: Edit the named key in the TOML, then rerun."
            ),
            CliError::Image { path, reason } => format!(
                "What happened: Could not load image {path} ({reason}).\nLikely causes: Wrong path or a format other than PNG/JPEG.\nHow to fix: Pass a readable PNG or JPEG via --image."
            ),
            CliError::EstopLatched(reason) => match reason {
                Some(EstopReason::SenseStall) => "What happened: The watchdog stopped every actuator because sensing stalled.\nLikely causes: Camera unplugged, failing reads, or a frame rate far below sense.rate_hz.\nHow to fix: Check the camera, then restart; raise safety.watchdog_timeout_ms if the stall was expected.".to_string(),
                Some(EstopReason::ControlStall) => "What happened: The watchdog stopped every actuator because the control loop stalled.\nLikely causes: Overloaded host or a blocked PWM bus.\nHow to fix: Check system load and PWM wiring, then restart.".to_string(),
                Some(EstopReason::External) | None => "What happened: Emergency stop was triggered.\nLikely causes: Operator request.\nHow to fix: Clear the cause, then start a new run.".to_string(),
            },
            CliError::BackendUnavailable { backend, feature } => format!(
                "What happened: camera.backend = \"{backend}\" is not available in this build.\nLikely causes: Built without the `{feature}` feature, or not on Linux.\nHow to fix: Rebuild with --features {feature}, or pick the sim or file backend."
            ),
        };
    }

    if let Some(be) = err.downcast_ref::<BuildError>() {
        return match be {
            BuildError::MissingCamera => {
                "What happened: No camera was provided to the pipeline.\nLikely causes: Camera backend failed to initialize or was not wired into the builder.\nHow to fix: Check camera.backend and pass the camera via with_camera(...).".to_string()
            }
            BuildError::MissingBus => {
                "What happened: No PWM bus was provided to the pipeline.\nLikely causes: GPIO failed to initialize or was not wired into the builder.\nHow to fix: Ensure the PWM bus is created successfully and passed via with_bus(...).".to_string()
            }
            BuildError::MissingSegmentation => {
                "What happened: No segmentation backend was provided to the pipeline.\nLikely causes: The builder was not configured.\nHow to fix: Pass one via with_segmentation(...).".to_string()
            }
            BuildError::InvalidConfig(msg) => format!(
                "What happened: Invalid configuration ({msg}).\nLikely causes: Rates or timeouts that cannot work together.\nHow to fix: Edit the config file, then rerun."
            ),
        };
    }

    if let Some(fe) = err.downcast_ref::<FrothError>() {
        return match fe {
            FrothError::Acquisition(AcquisitionError::OpenFailed { attempts, reason }) => format!(
                "What happened: Camera failed to open after {attempts} attempt(s) ({reason}).\nLikely causes: Device missing, busy, or a bad camera.path.\nHow to fix: Check the camera connection and [camera] settings; raise camera.max_retries if it is slow to come up."
            ),
            FrothError::Acquisition(other) => format!(
                "What happened: Frame acquisition failed ({other}).\nLikely causes: Camera disconnected or too slow for camera.read_timeout_ms.\nHow to fix: Check the camera and its timeout, then rerun."
            ),
            FrothError::Startup(StartupError::Claim { channel, pin, reason }) => format!(
                "What happened: Could not claim the {channel} output on pin {pin} ({reason}).\nLikely causes: Wrong pin number, pin in use, or missing GPIO permissions.\nHow to fix: Fix [pins] in the config and make sure the process may access GPIO."
            ),
            FrothError::Startup(StartupError::Zero { channel, pin, reason }) => format!(
                "What happened: Could not set the {channel} output on pin {pin} to 0 ({reason}).\nLikely causes: PWM driver fault.\nHow to fix: Check the wiring for that channel before restarting."
            ),
            FrothError::Control(ControlError::OutOfRange { field, value, min, max }) => format!(
                "What happened: {field} = {value} is out of range.\nLikely causes: Command-line override outside [{min}, {max}].\nHow to fix: Pass a value within range."
            ),
            FrothError::Timeout => "What happened: Hardware operation timed out.\nLikely causes: Device not responding.\nHow to fix: Check power and connections.".to_string(),
            // Fallback to generic for other domain errors
            other => format!(
                "What happened: {other}.\nLikely causes: See logs.\nHow to fix: Re-run with --log-level=debug or set RUST_LOG for more detail."
            ),
        };
    }

    // String-based heuristics for errors coming from init
    let msg = err.to_string();
    let lower = msg.to_ascii_lowercase();

    if lower.contains("gpio") {
        return "What happened: Failed to initialize GPIO.\nLikely causes: Not running on a Raspberry Pi or insufficient permissions.\nHow to fix: Run on the target board as a user in the gpio group, or build without --features hardware.".to_string();
    }

    if lower.contains("read config") {
        return format!(
            "What happened: {msg}.\nLikely causes: Wrong --config path.\nHow to fix: Pass an existing TOML file or omit --config for defaults."
        );
    }

    // Generic fallback
    let mut cause = String::new();
    if let Some(src) = err.source() {
        cause = format!(" Cause: {src}");
    }
    format!(
        "Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
    )
}

/// Stable exit codes. 2 is left to clap for usage errors.
pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    if let Some(ce) = err.downcast_ref::<CliError>() {
        return match ce {
            CliError::Config { .. } => 3,
            CliError::Image { .. } => 1,
            CliError::EstopLatched(_) => 6,
            CliError::BackendUnavailable { .. } => 3,
        };
    }
    if err.downcast_ref::<BuildError>().is_some() {
        return 3;
    }
    match err.downcast_ref::<FrothError>() {
        Some(FrothError::Acquisition(_)) => 4,
        Some(FrothError::Startup(_)) => 5,
        Some(FrothError::Control(_)) => 3,
        _ => 1,
    }
}

fn reason_for(err: &eyre::Report) -> &'static str {
    if let Some(ce) = err.downcast_ref::<CliError>() {
        return match ce {
            CliError::Config { .. } => "InvalidConfig",
            CliError::Image { .. } => "ImageLoad",
            CliError::EstopLatched(_) => "EmergencyStop",
            CliError::BackendUnavailable { .. } => "Unsupported",
        };
    }
    if err.downcast_ref::<BuildError>().is_some() {
        return "InvalidConfig";
    }
    match err.downcast_ref::<FrothError>() {
        Some(FrothError::Acquisition(_)) => "Acquisition",
        Some(FrothError::Startup(_)) => "Startup",
        Some(FrothError::Control(_)) => "OutOfRange",
        _ => "Error",
    }
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    use serde_json::json;

    let msg = humanize(err);
    let detail = match err.downcast_ref::<CliError>() {
        Some(CliError::EstopLatched(r)) => Some(json!({ "estop_reason": reason_name(r) })),
        Some(CliError::Config { path, .. }) => Some(json!({ "config": path })),
        Some(CliError::BackendUnavailable { backend, feature }) => {
            Some(json!({ "backend": backend, "feature": feature }))
        }
        _ => match err.downcast_ref::<FrothError>() {
            Some(FrothError::Acquisition(AcquisitionError::OpenFailed { attempts, .. })) => {
                Some(json!({ "attempts": attempts }))
            }
            Some(FrothError::Startup(
                StartupError::Claim { channel, pin, .. } | StartupError::Zero { channel, pin, .. },
            )) => Some(json!({ "channel": channel.name(), "pin": pin })),
            _ => None,
        },
    };

    let obj = if let Some(d) = detail {
        json!({ "reason": reason_for(err), "details": d, "message": msg })
    } else {
        json!({ "reason": reason_for(err), "message": msg })
    };
    obj.to_string()
}

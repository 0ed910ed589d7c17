use thiserror::Error;

use crate::actuator::Channel;

#[derive(Debug, Error, Clone)]
pub enum FrothError {
    #[error("hardware error: {0}")]
    Hardware(String),
    #[error("hardware timeout")]
    Timeout,
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid state: {0}")]
    State(String),
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),
    #[error(transparent)]
    Startup(#[from] StartupError),
    #[error(transparent)]
    Control(#[from] ControlError),
}

/// Camera-side failures, per read or at open time.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AcquisitionError {
    #[error("camera failed to open after {attempts} attempt(s): {reason}")]
    OpenFailed { attempts: u32, reason: String },
    #[error("camera not open")]
    NotOpen,
    #[error("frame read failed: {0}")]
    ReadFailed(String),
    #[error("no fresh frame: {0}")]
    Stale(String),
}

/// Actuator initialization failures. Already-claimed pins are released
/// before this is returned.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StartupError {
    #[error("claiming {channel} (pin {pin}) failed: {reason}")]
    Claim {
        channel: Channel,
        pin: u8,
        reason: String,
    },
    #[error("zeroing {channel} (pin {pin}) failed: {reason}")]
    Zero {
        channel: Channel,
        pin: u8,
        reason: String,
    },
}

/// Rejected external parameter updates.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ControlError {
    #[error("{field} = {value} out of range [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("frother duty is owned by the controller in AUTO mode")]
    FrotherInAuto,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("missing camera")]
    MissingCamera,
    #[error("missing pwm bus")]
    MissingBus,
    #[error("missing segmentation")]
    MissingSegmentation,
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;

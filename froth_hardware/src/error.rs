use thiserror::Error;

/// Errors raised by the camera and PWM backends.
#[derive(Debug, Error)]
pub enum HwError {
    #[error("gpio error: {0}")]
    Gpio(String),
    #[error("camera timeout")]
    Timeout,
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("pin {0} not claimed")]
    PinNotClaimed(u8),
    #[error("image decode: {0}")]
    Decode(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HwError>;

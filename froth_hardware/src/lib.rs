pub mod error;
pub mod file;
pub mod pixel;
#[cfg(all(feature = "hardware", target_os = "linux"))]
pub mod pwm;
pub mod sim;
#[cfg(all(feature = "v4l2", target_os = "linux"))]
pub mod v4l2;

pub use file::ImageFileCamera;
#[cfg(all(feature = "hardware", target_os = "linux"))]
pub use pwm::RppalPwm;
pub use sim::{SimCameraFaults, SimulatedCamera, SimulatedPwm};
#[cfg(all(feature = "v4l2", target_os = "linux"))]
pub use v4l2::V4l2Camera;

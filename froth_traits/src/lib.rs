//! Hardware and collaborator seams for the froth flotation controller.
//!
//! Everything behind these traits is swappable: the core only ever talks to a
//! `Camera`, a `PwmBus`, a `Segmentation` capability set and an optional
//! `Classifier`. Errors cross the seam as `Box<dyn Error + Send + Sync>` and are
//! mapped to typed errors by the core.
pub mod clock;
pub mod segmentation;

pub use clock::{Clock, MonotonicClock};
pub use segmentation::{Contour, DistanceImage, LabelImage, Point, Segmentation, WATERSHED_BOUNDARY};

use std::time::Duration;

use image::RgbImage;

/// Frame-producing device (USB camera, file replay, simulator).
pub trait Camera {
    /// Open the device. Called again after a failed read to reconnect.
    fn open(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Grab one frame, waiting at most `timeout` for the device.
    fn grab(
        &mut self,
        timeout: Duration,
    ) -> Result<RgbImage, Box<dyn std::error::Error + Send + Sync>>;

    /// Release the device. Must tolerate being called when already released.
    fn release(&mut self);
}

/// Pin-addressed PWM output bus (one GPIO chip, one PWM controller, ...).
pub trait PwmBus {
    /// Claim `pin` as an output.
    fn claim(&mut self, pin: u8) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Drive `pin` at `frequency_hz` with `duty_percent` in [0, 100].
    fn write(
        &mut self,
        pin: u8,
        frequency_hz: u32,
        duty_percent: f32,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Give `pin` back to the system.
    fn release(&mut self, pin: u8);

    /// Close the bus handle. Must tolerate repeated calls.
    fn close(&mut self);
}

/// Outcome of the anomaly classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Normal,
    Anomalous,
}

/// Opaque outlier model over `[bubble_count, avg_size, std_dev, coverage]`.
pub trait Classifier {
    fn classify(&self, features: &[f64; 4]) -> Classification;
}

/// Stand-in for an absent or untrained model.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysNormal;

impl Classifier for AlwaysNormal {
    fn classify(&self, _features: &[f64; 4]) -> Classification {
        Classification::Normal
    }
}

impl<T: Camera + ?Sized> Camera for Box<T> {
    fn open(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        (**self).open()
    }
    fn grab(
        &mut self,
        timeout: Duration,
    ) -> Result<RgbImage, Box<dyn std::error::Error + Send + Sync>> {
        (**self).grab(timeout)
    }
    fn release(&mut self) {
        (**self).release();
    }
}

impl<T: PwmBus + ?Sized> PwmBus for Box<T> {
    fn claim(&mut self, pin: u8) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        (**self).claim(pin)
    }
    fn write(
        &mut self,
        pin: u8,
        frequency_hz: u32,
        duty_percent: f32,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        (**self).write(pin, frequency_hz, duty_percent)
    }
    fn release(&mut self, pin: u8) {
        (**self).release(pin);
    }
    fn close(&mut self) {
        (**self).close();
    }
}

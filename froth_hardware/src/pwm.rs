use std::collections::HashMap;

use froth_traits::PwmBus;
use rppal::gpio::{Gpio, OutputPin};
use tracing::trace;

use crate::error::{HwError, Result};

/// Software PWM on Raspberry Pi GPIO pins via rppal.
pub struct RppalPwm {
    gpio: Option<Gpio>,
    pins: HashMap<u8, OutputPin>,
}

impl RppalPwm {
    pub fn new() -> Result<Self> {
        let gpio = Gpio::new().map_err(|e| HwError::Gpio(e.to_string()))?;
        Ok(Self {
            gpio: Some(gpio),
            pins: HashMap::new(),
        })
    }
}

impl PwmBus for RppalPwm {
    fn claim(&mut self, pin: u8) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let gpio = self
            .gpio
            .as_ref()
            .ok_or_else(|| HwError::DeviceUnavailable("gpio closed".into()))?;
        let mut out = gpio
            .get(pin)
            .map_err(|e| HwError::Gpio(format!("pin {pin}: {e}")))?
            .into_output_low();
        out.set_reset_on_drop(true);
        self.pins.insert(pin, out);
        Ok(())
    }

    fn write(
        &mut self,
        pin: u8,
        frequency_hz: u32,
        duty_percent: f32,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let out = self.pins.get_mut(&pin).ok_or(HwError::PinNotClaimed(pin))?;
        let duty = f64::from(duty_percent.clamp(0.0, 100.0)) / 100.0;
        if duty <= 0.0 {
            out.clear_pwm().map_err(|e| HwError::Gpio(e.to_string()))?;
            out.set_low();
        } else {
            out.set_pwm_frequency(f64::from(frequency_hz.max(1)), duty)
                .map_err(|e| HwError::Gpio(e.to_string()))?;
        }
        trace!(pin, duty_percent, "pwm write");
        Ok(())
    }

    fn release(&mut self, pin: u8) {
        if let Some(mut out) = self.pins.remove(&pin) {
            let _ = out.clear_pwm();
            out.set_low();
        }
    }

    fn close(&mut self) {
        let pins: Vec<u8> = self.pins.keys().copied().collect();
        for pin in pins {
            self.release(pin);
        }
        self.gpio = None;
    }
}

//! Proportional-integral controller for the frother duty cycle.
//!
//! ```text
//! error    = setpoint - measured
//! integral = clamp(integral + error * dt, -limit, limit)
//! output   = clamp(kp * error + ki * integral, 0, 100)
//! ```

use tracing::warn;

use crate::actuator::{DUTY_MAX, DUTY_MIN};

/// Default anti-windup bound on the integral term.
pub const INTEGRAL_LIMIT: f64 = 50.0;

#[derive(Debug, Clone)]
pub struct PiController {
    kp: f64,
    ki: f64,
    setpoint: f64,
    integral: f64,
    last_error: f64,
    integral_limit: f64,
}

impl PiController {
    pub fn new(kp: f64, ki: f64, setpoint: f64) -> Self {
        Self {
            kp,
            ki,
            setpoint,
            integral: 0.0,
            last_error: 0.0,
            integral_limit: INTEGRAL_LIMIT,
        }
    }

    /// Override the anti-windup bound. Non-finite or non-positive limits keep
    /// the default.
    #[must_use]
    pub fn with_integral_limit(mut self, limit: f64) -> Self {
        if limit.is_finite() && limit > 0.0 {
            self.integral_limit = limit;
        }
        self
    }

    /// One control step. `dt` is in seconds; non-finite or negative `dt`
    /// counts as 0. A non-finite measurement yields 0 and leaves the state
    /// untouched.
    pub fn update(&mut self, measured: f64, dt: f64) -> f64 {
        if !measured.is_finite() {
            warn!(measured, "non-finite measurement; no corrective action");
            return 0.0;
        }
        let dt = if dt.is_finite() && dt > 0.0 { dt } else { 0.0 };
        let error = self.setpoint - measured;
        self.integral = (self.integral + error * dt).clamp(-self.integral_limit, self.integral_limit);
        self.last_error = error;
        let out = self.kp * error + self.ki * self.integral;
        if out.is_finite() {
            out.clamp(DUTY_MIN, DUTY_MAX)
        } else {
            DUTY_MIN
        }
    }

    /// Update gains and setpoint for the next step. `None` keeps a value.
    pub fn set_params(&mut self, kp: Option<f64>, ki: Option<f64>, setpoint: Option<f64>) {
        if let Some(kp) = kp {
            self.kp = kp;
        }
        if let Some(ki) = ki {
            self.ki = ki;
        }
        if let Some(sp) = setpoint {
            self.setpoint = sp;
        }
    }

    /// Zero the integral and the last error.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_error = 0.0;
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn last_error(&self) -> f64 {
        self.last_error
    }

    pub fn kp(&self) -> f64 {
        self.kp
    }

    pub fn ki(&self) -> f64 {
        self.ki
    }

    pub fn setpoint(&self) -> f64 {
        self.setpoint
    }
}

impl Default for PiController {
    fn default() -> Self {
        Self::new(0.5, 0.05, 120.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worked_example() {
        let mut pi = PiController::new(0.5, 0.05, 120.0);
        let out = pi.update(80.0, 1.0);
        assert_eq!(pi.last_error(), 40.0);
        assert_eq!(pi.integral(), 40.0);
        assert!((out - 22.0).abs() < 1e-12);
    }

    #[test]
    fn integral_saturates() {
        let mut pi = PiController::new(0.0, 1.0, 100.0);
        for _ in 0..10 {
            pi.update(0.0, 1.0);
        }
        assert_eq!(pi.integral(), INTEGRAL_LIMIT);
    }

    #[test]
    fn bad_dt_is_pass_through() {
        let mut pi = PiController::new(1.0, 1.0, 10.0);
        for dt in [f64::NAN, -1.0, f64::INFINITY] {
            let out = pi.update(5.0, dt);
            assert_eq!(pi.integral(), 0.0);
            assert_eq!(out, 5.0);
        }
    }

    #[test]
    fn nan_measurement_is_zero_action() {
        let mut pi = PiController::new(1.0, 1.0, 10.0);
        pi.update(5.0, 1.0);
        let before = pi.integral();
        assert_eq!(pi.update(f64::NAN, 1.0), 0.0);
        assert_eq!(pi.integral(), before);
    }
}

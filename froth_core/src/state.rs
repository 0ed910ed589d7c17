//! Shared state between the loops and external readers/writers.
//!
//! `SharedState` holds two independently locked groups:
//! - the published `SharedSnapshot` (`RwLock`): readers always clone a
//!   complete value, writers replace fields under the write lock
//! - the requested `ControlParams` (`Mutex`): written by the control handle,
//!   copied out at the start of every control tick
//!
//! Lock order where both are held: params, then snapshot.
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use crate::actuator::DeviceState;
use crate::analyze::FrothMetrics;
use crate::config::ControlCfg;
use crate::error::FrothError;
use crate::safety::SafetyState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Auto,
    Manual,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Auto => "AUTO",
            Mode::Manual => "MANUAL",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = FrothError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Mode::Auto),
            "manual" => Ok(Mode::Manual),
            other => Err(FrothError::Config(format!("unknown mode '{other}'"))),
        }
    }
}

/// Controller parameters requested by the operator. The control loop reads a
/// copy at the start of each tick.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlParams {
    pub mode: Mode,
    pub setpoint: f64,
    pub kp: f64,
    pub ki: f64,
    pub manual_duty: f64,
    /// Requested duty for the auxiliary channels; the frother entry is unused.
    pub devices: DeviceState,
    /// Bumped on every entry into AUTO and on every emergency stop or reset.
    /// The control loop clears the integral whenever it sees a new value.
    pub auto_epoch: u64,
}

impl ControlParams {
    /// Switch mode, bumping the epoch when this enters AUTO. Returns the
    /// previous mode.
    pub fn switch_mode(&mut self, mode: Mode) -> Mode {
        let prev = std::mem::replace(&mut self.mode, mode);
        if mode == Mode::Auto && prev != Mode::Auto {
            self.auto_epoch += 1;
        }
        prev
    }
}

impl From<&ControlCfg> for ControlParams {
    fn from(c: &ControlCfg) -> Self {
        Self {
            mode: c.mode,
            setpoint: c.setpoint,
            kp: c.kp,
            ki: c.ki,
            manual_duty: c.manual_duty,
            devices: c.devices,
            auto_epoch: 0,
        }
    }
}

/// Controller state as last published by the control loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlState {
    pub mode: Mode,
    pub setpoint: f64,
    pub kp: f64,
    pub ki: f64,
    /// Always within the anti-windup bound.
    pub integral: f64,
    pub manual_duty_cycle: f64,
}

impl ControlState {
    pub fn from_params(p: &ControlParams, integral: f64) -> Self {
        Self {
            mode: p.mode,
            setpoint: p.setpoint,
            kp: p.kp,
            ki: p.ki,
            integral,
            manual_duty_cycle: p.manual_duty,
        }
    }
}

/// One consistent view of the whole system.
#[derive(Debug, Clone)]
pub struct SharedSnapshot {
    /// `None` until the first frame has been analysed.
    pub metrics: Option<FrothMetrics>,
    pub control: ControlState,
    /// Duty last commanded to each channel.
    pub devices: DeviceState,
    pub safety: SafetyState,
    pub sense_healthy: bool,
    pub frame_rate: f64,
}

pub struct SharedState {
    snapshot: RwLock<SharedSnapshot>,
    params: Mutex<ControlParams>,
}

impl SharedState {
    pub fn new(params: ControlParams, safety: SafetyState) -> Self {
        let snapshot = SharedSnapshot {
            metrics: None,
            control: ControlState::from_params(&params, 0.0),
            devices: DeviceState::default(),
            safety,
            sense_healthy: false,
            frame_rate: 0.0,
        };
        Self {
            snapshot: RwLock::new(snapshot),
            params: Mutex::new(params),
        }
    }

    /// Cloned copy of the published snapshot.
    pub fn snapshot(&self) -> SharedSnapshot {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Mutate the published snapshot under the write lock.
    pub fn publish(&self, f: impl FnOnce(&mut SharedSnapshot)) {
        let mut guard = self
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut guard);
    }

    /// Copy of the requested control parameters.
    pub fn params(&self) -> ControlParams {
        self.lock_params().clone()
    }

    /// Mutate the control parameters and mirror them into the snapshot in
    /// one step, so readers never observe a half-applied request.
    pub fn update_params<R>(&self, f: impl FnOnce(&mut ControlParams) -> R) -> R {
        let mut params = self.lock_params();
        let out = f(&mut params);
        let p = params.clone();
        self.publish(|s| {
            s.control = ControlState::from_params(&p, s.control.integral);
        });
        out
    }

    fn lock_params(&self) -> MutexGuard<'_, ControlParams> {
        self.params.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::Channel;
    use crate::safety::SafetySupervisor;
    use std::time::Duration;

    fn shared() -> SharedState {
        let sup = SafetySupervisor::new(Duration::from_secs(5));
        SharedState::new(ControlParams::from(&ControlCfg::default()), sup.state())
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("AUTO".parse::<Mode>().unwrap(), Mode::Auto);
        assert_eq!("manual".parse::<Mode>().unwrap(), Mode::Manual);
        assert!("cruise".parse::<Mode>().is_err());
    }

    #[test]
    fn param_updates_are_mirrored_and_keep_integral() {
        let s = shared();
        s.publish(|snap| snap.control.integral = 12.0);
        s.update_params(|p| {
            p.setpoint = 90.0;
            p.devices.set(Channel::Agitator, 70.0);
        });
        let snap = s.snapshot();
        assert_eq!(snap.control.setpoint, 90.0);
        assert_eq!(snap.control.integral, 12.0);
        assert_eq!(s.params().devices.get(Channel::Agitator), 70.0);
    }

    #[test]
    fn only_entering_auto_bumps_the_epoch() {
        let mut p = ControlParams::from(&ControlCfg::default());
        assert_eq!(p.switch_mode(Mode::Auto), Mode::Auto);
        assert_eq!(p.auto_epoch, 0);
        p.switch_mode(Mode::Manual);
        assert_eq!(p.auto_epoch, 0);
        assert_eq!(p.switch_mode(Mode::Auto), Mode::Manual);
        assert_eq!(p.auto_epoch, 1);
    }

    #[test]
    fn snapshot_starts_without_metrics() {
        let snap = shared().snapshot();
        assert!(snap.metrics.is_none());
        assert!(snap.devices.all_zero());
        assert!(!snap.safety.estop_active);
    }
}

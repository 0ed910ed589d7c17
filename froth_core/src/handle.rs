//! Operator-facing handle: read the published state, change parameters,
//! trigger or clear the emergency stop, and subscribe to frame and metrics
//! streams.
//!
//! All writes are range-checked here; nothing out of range reaches the
//! control loop.
use std::sync::Arc;

use crossbeam_channel as xch;
use tracing::{info, warn};

use crate::actuator::{Channel, DUTY_MAX, DUTY_MIN, DeviceState};
use crate::analyze::FrothMetrics;
use crate::error::ControlError;
use crate::queue::{FrameQueue, LatestSlot, MetricsQueue};
use crate::safety::{SafetyState, SafetySupervisor};
use crate::source::Frame;
use crate::state::{ControlState, Mode, SharedSnapshot, SharedState};

pub const SETPOINT_RANGE: (f64, f64) = (0.0, 500.0);
pub const KP_RANGE: (f64, f64) = (0.0, 10.0);
pub const KI_RANGE: (f64, f64) = (0.0, 1.0);

fn in_range(field: &'static str, value: f64, (min, max): (f64, f64)) -> Result<f64, ControlError> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(ControlError::OutOfRange {
            field,
            value,
            min,
            max,
        })
    }
}

#[derive(Clone)]
pub struct ControlHandle {
    shared: Arc<SharedState>,
    safety: Arc<SafetySupervisor>,
    latest: Arc<LatestSlot<FrothMetrics>>,
    frames: FrameQueue<Frame>,
    metrics: MetricsQueue<FrothMetrics>,
}

impl ControlHandle {
    pub fn new(
        shared: Arc<SharedState>,
        safety: Arc<SafetySupervisor>,
        latest: Arc<LatestSlot<FrothMetrics>>,
        frames: FrameQueue<Frame>,
        metrics: MetricsQueue<FrothMetrics>,
    ) -> Self {
        Self {
            shared,
            safety,
            latest,
            frames,
            metrics,
        }
    }

    // ── Reads ────────────────────────────────────────────────────────────────

    /// Copy of the full published state, with the live safety state.
    pub fn snapshot(&self) -> SharedSnapshot {
        let mut snap = self.shared.snapshot();
        snap.safety = self.safety.state();
        snap
    }

    /// Most recent metrics, `None` before the first analysed frame.
    pub fn metrics(&self) -> Option<FrothMetrics> {
        self.latest.latest()
    }

    pub fn control_state(&self) -> ControlState {
        self.shared.snapshot().control
    }

    pub fn device_state(&self) -> DeviceState {
        self.shared.snapshot().devices
    }

    pub fn safety_state(&self) -> SafetyState {
        self.safety.state()
    }

    // ── Writes ───────────────────────────────────────────────────────────────

    pub fn set_mode(&self, mode: Mode) {
        let prev = self.shared.update_params(|p| p.switch_mode(mode));
        if prev != mode {
            info!(from = %prev, to = %mode, "control mode changed");
        }
    }

    pub fn set_setpoint(&self, setpoint: f64) -> Result<(), ControlError> {
        let v = in_range("setpoint", setpoint, SETPOINT_RANGE)?;
        self.shared.update_params(|p| p.setpoint = v);
        info!(setpoint = v, "setpoint updated");
        Ok(())
    }

    /// Both gains are checked before either is applied.
    pub fn set_gains(&self, kp: f64, ki: f64) -> Result<(), ControlError> {
        let kp = in_range("kp", kp, KP_RANGE)?;
        let ki = in_range("ki", ki, KI_RANGE)?;
        self.shared.update_params(|p| {
            p.kp = kp;
            p.ki = ki;
        });
        info!(kp, ki, "gains updated");
        Ok(())
    }

    /// Frother duty used while in MANUAL mode.
    pub fn set_manual_duty(&self, duty: f64) -> Result<(), ControlError> {
        let v = in_range("manual_duty", duty, (DUTY_MIN, DUTY_MAX))?;
        self.shared.update_params(|p| p.manual_duty = v);
        info!(duty = v, "manual duty updated");
        Ok(())
    }

    /// Request a duty for one channel. The frother belongs to the controller
    /// in AUTO mode; in MANUAL mode this sets the manual duty.
    pub fn set_device_duty(&self, channel: Channel, duty: f64) -> Result<(), ControlError> {
        let v = in_range(channel.name(), duty, (DUTY_MIN, DUTY_MAX))?;
        self.shared.update_params(|p| {
            if channel == Channel::Frother {
                if p.mode == Mode::Auto {
                    return Err(ControlError::FrotherInAuto);
                }
                p.manual_duty = v;
            } else {
                p.devices.set(channel, v);
            }
            Ok(())
        })?;
        info!(%channel, duty = v, "device duty requested");
        Ok(())
    }

    /// Stop every actuator now and latch. Also parks the requested state at
    /// MANUAL with every duty at 0 so a later reset restarts nothing.
    /// Returns whether this call tripped the latch.
    pub fn emergency_stop(&self) -> bool {
        self.shared.update_params(|p| {
            p.mode = Mode::Manual;
            p.manual_duty = 0.0;
            p.devices = DeviceState::default();
            p.auto_epoch += 1;
        });
        let tripped = self.safety.trigger();
        if !tripped {
            warn!("emergency stop requested while already stopped");
        }
        tripped
    }

    /// Clear a latched emergency stop. Operator action only.
    pub fn reset_estop(&self) {
        // Whatever mode the reset resumes in starts from a clean integral
        self.shared.update_params(|p| p.auto_epoch += 1);
        self.safety.reset();
        let state = self.safety.state();
        self.shared.publish(|s| s.safety = state);
    }

    pub fn is_estopped(&self) -> bool {
        !self.safety.is_safe_to_run()
    }

    // ── Streams ──────────────────────────────────────────────────────────────

    /// Live frames; holds at most the configured number, oldest replaced.
    pub fn frames(&self) -> xch::Receiver<Frame> {
        self.frames.receiver()
    }

    /// Metrics stream; new records are dropped while it is full.
    pub fn metrics_stream(&self) -> xch::Receiver<FrothMetrics> {
        self.metrics.receiver()
    }

    pub fn frames_replaced(&self) -> u64 {
        self.frames.replaced()
    }

    pub fn metrics_dropped(&self) -> u64 {
        self.metrics.dropped()
    }
}

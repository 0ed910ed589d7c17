//! Watchdog safety supervisor.
//!
//! The sense and control loops each beat their own heartbeat. `check()`
//! compares both ages against the watchdog timeout; a stale heartbeat trips
//! the emergency stop. The stop latches until `reset()`.
//!
//! Lock order: the stop callback runs after the internal mutex is released,
//! so a callback may take other locks (the actuator driver) without risk of
//! inverting with callers that hold those locks and query `is_safe_to_run`.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use froth_traits::{Clock, MonotonicClock};
use tracing::{error, info, warn};

/// Why the emergency stop latched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstopReason {
    SenseStall,
    ControlStall,
    External,
}

impl EstopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EstopReason::SenseStall => "sense_stall",
            EstopReason::ControlStall => "control_stall",
            EstopReason::External => "external",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SafetyState {
    pub last_sense_heartbeat: Instant,
    pub last_control_heartbeat: Instant,
    pub estop_active: bool,
    pub estop_reason: Option<EstopReason>,
}

struct Heartbeats {
    sense: Instant,
    control: Instant,
    reason: Option<EstopReason>,
}

type StopCallback = Arc<dyn Fn() + Send + Sync>;

pub struct SafetySupervisor {
    clock: Arc<dyn Clock + Send + Sync>,
    timeout: Duration,
    estop: AtomicBool,
    beats: Mutex<Heartbeats>,
    callback: Mutex<Option<StopCallback>>,
    trips: AtomicU64,
}

impl SafetySupervisor {
    pub fn new(timeout: Duration) -> Self {
        Self::with_clock(timeout, Arc::new(MonotonicClock::new()))
    }

    /// Heartbeats start at "now" on the given clock.
    pub fn with_clock(timeout: Duration, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        let now = clock.now();
        info!(timeout_ms = timeout.as_millis() as u64, "safety supervisor armed");
        Self {
            clock,
            timeout,
            estop: AtomicBool::new(false),
            beats: Mutex::new(Heartbeats {
                sense: now,
                control: now,
                reason: None,
            }),
            callback: Mutex::new(None),
            trips: AtomicU64::new(0),
        }
    }

    fn beats(&self) -> MutexGuard<'_, Heartbeats> {
        self.beats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the actuator-stop action, replacing any earlier one.
    pub fn register_stop_callback(&self, f: impl Fn() + Send + Sync + 'static) {
        let mut slot = self.callback.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(Arc::new(f));
    }

    pub fn beat_sense(&self) {
        self.beats().sense = self.clock.now();
    }

    pub fn beat_control(&self) {
        self.beats().control = self.clock.now();
    }

    /// Check both heartbeats. Returns `true` when it is safe to keep running.
    pub fn check(&self) -> bool {
        if self.estop.load(Ordering::Acquire) {
            return false;
        }
        let now = self.clock.now();
        let stalled = {
            let b = self.beats();
            let sense_age = now.saturating_duration_since(b.sense);
            let control_age = now.saturating_duration_since(b.control);
            if sense_age > self.timeout {
                Some((EstopReason::SenseStall, sense_age))
            } else if control_age > self.timeout {
                Some((EstopReason::ControlStall, control_age))
            } else {
                None
            }
        };
        match stalled {
            Some((reason, age)) => {
                error!(
                    reason = reason.as_str(),
                    age_ms = age.as_millis() as u64,
                    "heartbeat timeout"
                );
                self.emergency_stop(reason);
                false
            }
            None => true,
        }
    }

    /// Latch the emergency stop and run the stop callback. Only the first
    /// call after a reset has any effect; returns whether this call tripped.
    pub fn emergency_stop(&self, reason: EstopReason) -> bool {
        {
            // Latch and reason change together under the heartbeat lock, so
            // `state` never sees one without the other.
            let mut b = self.beats();
            if self.estop.load(Ordering::Acquire) {
                return false;
            }
            b.reason = Some(reason);
            self.estop.store(true, Ordering::Release);
        }
        self.trips.fetch_add(1, Ordering::Relaxed);
        error!(reason = reason.as_str(), "EMERGENCY STOP");

        let callback = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match callback {
            Some(cb) => cb(),
            None => warn!("emergency stop with no stop callback registered"),
        }
        true
    }

    /// Externally requested stop; honoured in every mode.
    pub fn trigger(&self) -> bool {
        self.emergency_stop(EstopReason::External)
    }

    pub fn is_safe_to_run(&self) -> bool {
        !self.estop.load(Ordering::Acquire)
    }

    /// Clear the latch and restart both heartbeats from now. Only for an
    /// explicit operator action.
    pub fn reset(&self) {
        let now = self.clock.now();
        {
            let mut b = self.beats();
            b.sense = now;
            b.control = now;
            b.reason = None;
            self.estop.store(false, Ordering::Release);
        }
        info!("safety supervisor reset");
    }

    pub fn state(&self) -> SafetyState {
        let b = self.beats();
        SafetyState {
            last_sense_heartbeat: b.sense,
            last_control_heartbeat: b.control,
            estop_active: self.estop.load(Ordering::Acquire),
            estop_reason: b.reason,
        }
    }

    /// Number of times the stop has latched since construction.
    pub fn trips(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn clock(&self) -> &Arc<dyn Clock + Send + Sync> {
        &self.clock
    }
}

use std::thread;
use std::time::{Duration, Instant};

/// Time source for the loops and the watchdog. Everything that compares
/// heartbeats or paces a tick reads time through this trait so tests can
/// drive it by hand.
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, d: Duration);

    /// Whole milliseconds since `epoch`; 0 if `epoch` is later than now.
    fn ms_since(&self, epoch: Instant) -> u64 {
        u64::try_from(self.now().saturating_duration_since(epoch).as_millis()).unwrap_or(u64::MAX)
    }

    /// Seconds since `earlier`; the control loop's `dt`.
    fn secs_since(&self, earlier: Instant) -> f64 {
        self.now().saturating_duration_since(earlier).as_secs_f64()
    }
}

/// Wall-independent clock backed by `Instant::now`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl MonotonicClock {
    #[inline]
    pub fn new() -> Self {
        Self
    }
}

impl Clock for MonotonicClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }

    #[inline]
    fn sleep(&self, d: Duration) {
        if !d.is_zero() {
            thread::sleep(d);
        }
    }
}

#[cfg(any(test, feature = "test-clock"))]
pub mod test_clock {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Manually driven clock. `sleep` advances time instead of blocking, and
    /// clones share one offset, so a clone handed to the supervisor or a
    /// frame source moves whenever the test advances its own copy.
    #[derive(Debug, Clone)]
    pub struct TestClock {
        origin: Instant,
        offset_ns: Arc<AtomicU64>,
    }

    impl Default for TestClock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl TestClock {
        pub fn new() -> Self {
            Self {
                origin: Instant::now(),
                offset_ns: Arc::new(AtomicU64::new(0)),
            }
        }

        pub fn advance(&self, d: Duration) {
            let ns = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
            let _ = self
                .offset_ns
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                    Some(cur.saturating_add(ns))
                });
        }

        /// Time advanced so far.
        pub fn elapsed(&self) -> Duration {
            Duration::from_nanos(self.offset_ns.load(Ordering::Acquire))
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> Instant {
            self.origin + self.elapsed()
        }

        fn sleep(&self, d: Duration) {
            self.advance(d);
        }
    }
}

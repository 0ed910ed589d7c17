//! Simulated camera and PWM bus.
//!
//! Both backends are `Send` so they can be moved into the pipeline threads, and
//! both expose a cloneable probe so tests can inject faults and inspect what
//! the core did to them.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use froth_traits::{Camera, PwmBus};
use image::{Rgb, RgbImage};

use crate::error::HwError;

const BACKGROUND: u8 = 205;
const BUBBLE_CORE: u8 = 45;

/// Fault injection shared between a `SimulatedCamera` and the test driving it.
#[derive(Debug, Clone, Default)]
pub struct SimCameraFaults {
    fail_open: Arc<AtomicBool>,
    fail_reads: Arc<AtomicU32>,
    timeout_reads: Arc<AtomicU32>,
    grabs: Arc<AtomicU64>,
    opens: Arc<AtomicU32>,
    releases: Arc<AtomicU32>,
}

impl SimCameraFaults {
    /// Make every `open()` fail until cleared.
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::Relaxed);
    }

    /// Fail the next `n` grabs with a device error.
    pub fn fail_next_reads(&self, n: u32) {
        self.fail_reads.store(n, Ordering::Relaxed);
    }

    /// Time out the next `n` grabs.
    pub fn timeout_next_reads(&self, n: u32) {
        self.timeout_reads.store(n, Ordering::Relaxed);
    }

    pub fn grabs(&self) -> u64 {
        self.grabs.load(Ordering::Relaxed)
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::Relaxed)
    }

    pub fn releases(&self) -> u32 {
        self.releases.load(Ordering::Relaxed)
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Synthetic froth camera: dark round bubbles on a bright background.
///
/// Frames are generated from a seeded xorshift so a given seed always
/// produces the same frame sequence.
pub struct SimulatedCamera {
    width: u32,
    height: u32,
    bubbles: usize,
    min_radius: u32,
    max_radius: u32,
    seed: u64,
    rng: u64,
    open: bool,
    faults: SimCameraFaults,
}

impl SimulatedCamera {
    pub fn new(width: u32, height: u32, bubbles: usize) -> Self {
        let seed = 0x9E37_79B9_7F4A_7C15;
        Self {
            width: width.max(1),
            height: height.max(1),
            bubbles,
            min_radius: 8,
            max_radius: 16,
            seed,
            rng: seed,
            open: false,
            faults: SimCameraFaults::default(),
        }
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        // xorshift has a fixed point at zero
        self.seed = seed.max(1);
        self.rng = self.seed;
        self
    }

    #[must_use]
    pub fn with_radius_range(mut self, min_radius: u32, max_radius: u32) -> Self {
        self.min_radius = min_radius.max(1);
        self.max_radius = max_radius.max(self.min_radius);
        self
    }

    /// Handle for fault injection and call counters.
    pub fn faults(&self) -> SimCameraFaults {
        self.faults.clone()
    }

    fn next_u32(&mut self) -> u32 {
        let mut x = self.rng;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng = x;
        (x >> 32) as u32
    }

    fn range(&mut self, lo: u32, hi: u32) -> u32 {
        if hi <= lo {
            return lo;
        }
        lo + self.next_u32() % (hi - lo + 1)
    }

    fn render(&mut self) -> RgbImage {
        let mut img = RgbImage::from_pixel(self.width, self.height, Rgb([BACKGROUND; 3]));
        let mut placed: Vec<(i64, i64, i64)> = Vec::with_capacity(self.bubbles);
        let attempts = self.bubbles * 20;
        for _ in 0..attempts {
            if placed.len() >= self.bubbles {
                break;
            }
            let r = self.range(self.min_radius, self.max_radius);
            let margin = r + 2;
            if self.width <= 2 * margin || self.height <= 2 * margin {
                break;
            }
            let cx = self.range(margin, self.width - margin - 1);
            let cy = self.range(margin, self.height - margin - 1);
            let (cx, cy, r) = (i64::from(cx), i64::from(cy), i64::from(r));
            let clear = placed.iter().all(|&(px, py, pr)| {
                let gap = pr + r + 4;
                (px - cx).pow(2) + (py - cy).pow(2) >= gap * gap
            });
            if clear {
                placed.push((cx, cy, r));
            }
        }
        for &(cx, cy, r) in &placed {
            fill_disc(&mut img, cx, cy, r);
        }
        img
    }
}

fn fill_disc(img: &mut RgbImage, cx: i64, cy: i64, r: i64) {
    let (w, h) = (i64::from(img.width()), i64::from(img.height()));
    for y in (cy - r).max(0)..=(cy + r).min(h - 1) {
        for x in (cx - r).max(0)..=(cx + r).min(w - 1) {
            if (x - cx).pow(2) + (y - cy).pow(2) <= r * r {
                img.put_pixel(x as u32, y as u32, Rgb([BUBBLE_CORE; 3]));
            }
        }
    }
}

impl Camera for SimulatedCamera {
    fn open(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.faults.opens.fetch_add(1, Ordering::Relaxed);
        if self.faults.fail_open.load(Ordering::Relaxed) {
            return Err(Box::new(HwError::DeviceUnavailable(
                "simulated camera refused to open".into(),
            )));
        }
        self.rng = self.seed;
        self.open = true;
        tracing::debug!(width = self.width, height = self.height, "simulated camera opened");
        Ok(())
    }

    fn grab(
        &mut self,
        _timeout: Duration,
    ) -> Result<RgbImage, Box<dyn std::error::Error + Send + Sync>> {
        if !self.open {
            return Err(Box::new(HwError::DeviceUnavailable(
                "simulated camera not open".into(),
            )));
        }
        if SimCameraFaults::take(&self.faults.timeout_reads) {
            return Err(Box::new(HwError::Timeout));
        }
        if SimCameraFaults::take(&self.faults.fail_reads) {
            self.open = false;
            return Err(Box::new(HwError::DeviceUnavailable(
                "simulated camera disconnected".into(),
            )));
        }
        self.faults.grabs.fetch_add(1, Ordering::Relaxed);
        Ok(self.render())
    }

    fn release(&mut self) {
        if self.open {
            self.open = false;
            self.faults.releases.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("simulated camera released");
        }
    }
}

#[derive(Debug, Default)]
struct PwmState {
    claimed: BTreeMap<u8, f32>,
    failing: Vec<u8>,
    failing_claims: Vec<u8>,
    writes: u64,
    closed: bool,
    claims: u32,
    releases: u32,
}

/// Recording PWM bus. Clones of the probe observe the same pins.
#[derive(Debug, Clone, Default)]
pub struct SimulatedPwm {
    state: Arc<Mutex<PwmState>>,
}

impl SimulatedPwm {
    pub fn new() -> Self {
        Self::default()
    }

    /// A second handle on the same bus for assertions.
    pub fn probe(&self) -> Self {
        self.clone()
    }

    fn with<R>(&self, f: impl FnOnce(&mut PwmState) -> R) -> R {
        match self.state.lock() {
            Ok(mut g) => f(&mut g),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Last duty written to `pin`, `None` if the pin is not claimed.
    pub fn duty(&self, pin: u8) -> Option<f32> {
        self.with(|s| s.claimed.get(&pin).copied())
    }

    pub fn is_claimed(&self, pin: u8) -> bool {
        self.with(|s| s.claimed.contains_key(&pin))
    }

    pub fn claimed_pins(&self) -> Vec<u8> {
        self.with(|s| s.claimed.keys().copied().collect())
    }

    pub fn writes(&self) -> u64 {
        self.with(|s| s.writes)
    }

    pub fn claims(&self) -> u32 {
        self.with(|s| s.claims)
    }

    pub fn releases(&self) -> u32 {
        self.with(|s| s.releases)
    }

    pub fn is_closed(&self) -> bool {
        self.with(|s| s.closed)
    }

    /// Make writes to `pin` fail until `heal_pin`.
    pub fn fail_pin(&self, pin: u8) {
        self.with(|s| s.failing.push(pin));
    }

    pub fn heal_pin(&self, pin: u8) {
        self.with(|s| s.failing.retain(|&p| p != pin));
    }

    /// Make `claim(pin)` fail.
    pub fn fail_claim(&self, pin: u8) {
        self.with(|s| s.failing_claims.push(pin));
    }
}

impl PwmBus for SimulatedPwm {
    fn claim(&mut self, pin: u8) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.with(|s| {
            if s.failing_claims.contains(&pin) {
                return Err(HwError::Gpio(format!("pin {pin} busy")));
            }
            s.closed = false;
            s.claims += 1;
            s.claimed.insert(pin, 0.0);
            Ok(())
        })?;
        Ok(())
    }

    fn write(
        &mut self,
        pin: u8,
        _frequency_hz: u32,
        duty_percent: f32,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.with(|s| {
            if s.failing.contains(&pin) {
                return Err(HwError::Gpio(format!("write to pin {pin} failed")));
            }
            let Some(slot) = s.claimed.get_mut(&pin) else {
                return Err(HwError::PinNotClaimed(pin));
            };
            *slot = duty_percent;
            s.writes += 1;
            Ok(())
        })?;
        Ok(())
    }

    fn release(&mut self, pin: u8) {
        self.with(|s| {
            if s.claimed.remove(&pin).is_some() {
                s.releases += 1;
            }
        });
    }

    fn close(&mut self) {
        self.with(|s| s.closed = true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_frames() {
        let mut a = SimulatedCamera::new(160, 120, 6).with_seed(7);
        let mut b = SimulatedCamera::new(160, 120, 6).with_seed(7);
        a.open().unwrap();
        b.open().unwrap();
        let fa = a.grab(Duration::from_millis(10)).unwrap();
        let fb = b.grab(Duration::from_millis(10)).unwrap();
        assert_eq!(fa.as_raw(), fb.as_raw());
    }

    #[test]
    fn frames_contain_dark_bubbles() {
        let mut cam = SimulatedCamera::new(160, 120, 4);
        cam.open().unwrap();
        let f = cam.grab(Duration::from_millis(10)).unwrap();
        let dark = f.pixels().filter(|p| p.0[0] == BUBBLE_CORE).count();
        assert!(dark > 0);
        assert_eq!(f.dimensions(), (160, 120));
    }

    #[test]
    fn grab_before_open_fails() {
        let mut cam = SimulatedCamera::new(32, 32, 1);
        assert!(cam.grab(Duration::from_millis(1)).is_err());
    }

    #[test]
    fn injected_timeout_is_typed() {
        let mut cam = SimulatedCamera::new(64, 64, 1);
        cam.open().unwrap();
        cam.faults().timeout_next_reads(1);
        let err = cam.grab(Duration::from_millis(1)).unwrap_err();
        assert!(matches!(err.downcast_ref::<HwError>(), Some(HwError::Timeout)));
        assert!(cam.grab(Duration::from_millis(1)).is_ok());
    }

    #[test]
    fn release_is_idempotent() {
        let mut cam = SimulatedCamera::new(64, 64, 1);
        let faults = cam.faults();
        cam.open().unwrap();
        cam.release();
        cam.release();
        assert_eq!(faults.releases(), 1);
    }

    #[test]
    fn pwm_records_and_fails_on_request() {
        let mut bus = SimulatedPwm::new();
        let probe = bus.probe();
        bus.claim(12).unwrap();
        bus.write(12, 1000, 42.0).unwrap();
        assert_eq!(probe.duty(12), Some(42.0));

        probe.fail_pin(12);
        assert!(bus.write(12, 1000, 10.0).is_err());
        assert_eq!(probe.duty(12), Some(42.0));

        assert!(bus.write(13, 1000, 10.0).is_err());
        bus.release(12);
        assert!(!probe.is_claimed(12));
    }
}

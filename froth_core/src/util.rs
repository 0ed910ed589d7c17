//! Common time/period and statistics helpers for froth_core.

use std::time::Duration;

/// Number of microseconds in one second.
pub const MICROS_PER_SEC: u64 = 1_000_000;

/// Period for a loop rate in Hz.
/// - Non-finite or non-positive rates are treated as 1 Hz.
/// - Ensures result is at least 1 microsecond.
#[inline]
pub fn period_from_hz(hz: f64) -> Duration {
    let hz = if hz.is_finite() && hz > 0.0 { hz } else { 1.0 };
    let us = (MICROS_PER_SEC as f64 / hz).round();
    Duration::from_micros((us as u64).max(1))
}

/// Arithmetic mean; 0 for an empty slice.
pub fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Population variance (divides by N); 0 for fewer than two values.
pub fn variance(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let m = mean(xs);
    xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / xs.len() as f64
}

/// Population standard deviation.
pub fn std_dev(xs: &[f64]) -> f64 {
    variance(xs).sqrt()
}

/// Clamp into `[lo, hi]`, mapping NaN to `lo`.
#[inline]
pub fn clamp_or_floor(v: f64, lo: f64, hi: f64) -> f64 {
    if v.is_nan() { lo } else { v.clamp(lo, hi) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_guards_bad_rates() {
        assert_eq!(period_from_hz(10.0), Duration::from_millis(100));
        assert_eq!(period_from_hz(0.0), Duration::from_secs(1));
        assert_eq!(period_from_hz(f64::NAN), Duration::from_secs(1));
        assert_eq!(period_from_hz(1e9), Duration::from_micros(1));
    }

    #[test]
    fn stats_match_population_definitions() {
        let xs = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_eq!(mean(&xs), 5.0);
        assert_eq!(variance(&xs), 4.0);
        assert_eq!(std_dev(&xs), 2.0);
        assert_eq!(variance(&[3.0]), 0.0);
        assert_eq!(mean(&[]), 0.0);
    }

    #[test]
    fn clamp_maps_nan_to_floor() {
        assert_eq!(clamp_or_floor(f64::NAN, 0.0, 100.0), 0.0);
        assert_eq!(clamp_or_floor(150.0, 0.0, 100.0), 100.0);
        assert_eq!(clamp_or_floor(-10.0, 0.0, 100.0), 0.0);
    }
}

//! `From` implementations bridging `froth_config` types to `froth_core` types.

use std::time::Duration;

use crate::actuator::{Channel, DeviceState};
use crate::config::{
    AnalyzerCfg, ChannelPins, ControlCfg, DetectorCfg, FrothCfg, PipelineCfg, PreprocessCfg,
    SafetyCfg, SourceCfg, StabilityWeights,
};
use crate::state::Mode;

// ── SourceCfg ────────────────────────────────────────────────────────────────

impl From<&froth_config::CameraCfg> for SourceCfg {
    fn from(c: &froth_config::CameraCfg) -> Self {
        Self {
            read_timeout: Duration::from_millis(c.read_timeout_ms),
            max_retries: c.max_retries,
            retry_backoff: Duration::from_millis(c.retry_backoff_ms),
        }
    }
}

// ── PreprocessCfg ────────────────────────────────────────────────────────────

impl From<&froth_config::PreprocessCfg> for PreprocessCfg {
    fn from(c: &froth_config::PreprocessCfg) -> Self {
        Self {
            blur_kernel: c.blur_kernel,
            morph_kernel: c.morph_kernel,
            opening_iterations: c.opening_iterations,
            closing_iterations: c.closing_iterations,
            invert: c.invert,
        }
    }
}

// ── DetectorCfg ──────────────────────────────────────────────────────────────

impl From<&froth_config::DetectorCfg> for DetectorCfg {
    fn from(c: &froth_config::DetectorCfg) -> Self {
        Self {
            min_area: c.min_area,
            distance_threshold: c.distance_threshold,
            circularity_threshold: c.circularity_threshold,
            dilation_iterations: c.dilation_iterations,
            background_kernel: c.background_kernel,
        }
    }
}

// ── AnalyzerCfg ──────────────────────────────────────────────────────────────

impl From<&froth_config::AnalyzerCfg> for AnalyzerCfg {
    fn from(c: &froth_config::AnalyzerCfg) -> Self {
        Self {
            history: c.history,
            weights: StabilityWeights {
                density_low: c.density_low,
                density_high: c.density_high,
                density_floor: c.density_floor,
                uniformity: c.weight_uniformity,
                consistency: c.weight_consistency,
                density: c.weight_density,
                neutral_consistency: c.neutral_consistency,
            },
        }
    }
}

// ── ChannelPins ──────────────────────────────────────────────────────────────

impl From<&froth_config::Pins> for ChannelPins {
    fn from(c: &froth_config::Pins) -> Self {
        Self {
            frother: c.frother,
            agitator: c.agitator,
            air_pump: c.air_pump,
            feed_pump: c.feed_pump,
            frequency_hz: c.pwm_frequency_hz,
        }
    }
}

// ── SafetyCfg ────────────────────────────────────────────────────────────────

impl From<&froth_config::SafetyCfg> for SafetyCfg {
    fn from(c: &froth_config::SafetyCfg) -> Self {
        Self {
            watchdog_timeout: Duration::from_millis(c.watchdog_timeout_ms),
        }
    }
}

// ── Mode ─────────────────────────────────────────────────────────────────────

impl From<froth_config::Mode> for Mode {
    fn from(m: froth_config::Mode) -> Self {
        match m {
            froth_config::Mode::Auto => Mode::Auto,
            froth_config::Mode::Manual => Mode::Manual,
        }
    }
}

// ── FrothCfg ─────────────────────────────────────────────────────────────────

impl From<&froth_config::Config> for FrothCfg {
    fn from(c: &froth_config::Config) -> Self {
        let mut devices = DeviceState::default();
        devices.set(Channel::Agitator, c.devices.agitator);
        devices.set(Channel::AirPump, c.devices.air_pump);
        devices.set(Channel::FeedPump, c.devices.feed_pump);
        Self {
            source: SourceCfg::from(&c.camera),
            preprocess: PreprocessCfg::from(&c.preprocess),
            detector: DetectorCfg::from(&c.detector),
            analyzer: AnalyzerCfg::from(&c.analyzer),
            pins: ChannelPins::from(&c.pins),
            safety: SafetyCfg::from(&c.safety),
            control: ControlCfg {
                mode: c.control.mode.into(),
                setpoint: c.control.setpoint,
                kp: c.control.kp,
                ki: c.control.ki,
                manual_duty: c.control.manual_duty,
                integral_limit: c.control.integral_limit,
                devices,
            },
            pipeline: PipelineCfg {
                sense_rate_hz: c.sense.rate_hz,
                control_rate_hz: c.control.rate_hz,
                frame_capacity: c.queues.frame_capacity,
                metrics_capacity: c.queues.metrics_capacity,
                sink_capacity: c.queues.sink_capacity,
                annotate_frames: c.sense.annotate,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_maps_to_default_runtime() {
        let cfg = FrothCfg::from(&froth_config::Config::default());
        let d = FrothCfg::default();
        assert_eq!(cfg.source.max_retries, d.source.max_retries);
        assert_eq!(cfg.detector.min_area, d.detector.min_area);
        assert_eq!(cfg.analyzer.weights, d.analyzer.weights);
        assert_eq!(cfg.control.devices, d.control.devices);
        assert_eq!(cfg.safety.watchdog_timeout, d.safety.watchdog_timeout);
        assert_eq!(cfg.pins.frother, 12);
    }
}

//! Actuator driver: four PWM channels behind a duty-cycle interface.
//!
//! Lifecycle:
//! - `start` claims every pin and drives it to 0%, or releases whatever it
//!   already claimed and returns a `StartupError`
//! - `set_duty_cycle` clamps to [0, 100] and records the clamp even when the
//!   hardware write fails
//! - `stop_all` zeroes each channel independently and reports failures
//! - `shutdown` (also run on drop) stops, releases and closes exactly once
use std::fmt;
use std::str::FromStr;

use froth_traits::PwmBus;
use tracing::{debug, error, info, warn};

use crate::config::ChannelPins;
use crate::error::{FrothError, StartupError};
use crate::hw_error::map_hw_error;
use crate::util::clamp_or_floor;

pub const DUTY_MIN: f64 = 0.0;
pub const DUTY_MAX: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Frother,
    Agitator,
    AirPump,
    FeedPump,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::Frother,
        Channel::Agitator,
        Channel::AirPump,
        Channel::FeedPump,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Channel::Frother => "frother",
            Channel::Agitator => "agitator",
            Channel::AirPump => "air_pump",
            Channel::FeedPump => "feed_pump",
        }
    }

    fn index(self) -> usize {
        self as usize
    }

    pub fn pin(self, pins: &ChannelPins) -> u8 {
        match self {
            Channel::Frother => pins.frother,
            Channel::Agitator => pins.agitator,
            Channel::AirPump => pins.air_pump,
            Channel::FeedPump => pins.feed_pump,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Channel {
    type Err = FrothError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| FrothError::Config(format!("unknown channel '{s}'")))
    }
}

/// Commanded duty per channel, always within [0, 100].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeviceState {
    duties: [f64; 4],
}

impl DeviceState {
    /// Frother at 0 and every other channel at `duty`.
    pub fn auxiliaries(duty: f64) -> Self {
        let mut s = Self::default();
        for ch in [Channel::Agitator, Channel::AirPump, Channel::FeedPump] {
            s.set(ch, duty);
        }
        s
    }

    pub fn get(&self, channel: Channel) -> f64 {
        self.duties[channel.index()]
    }

    /// Store the clamped duty and return it.
    pub fn set(&mut self, channel: Channel, duty: f64) -> f64 {
        let d = clamp_duty(duty);
        self.duties[channel.index()] = d;
        d
    }

    pub fn iter(&self) -> impl Iterator<Item = (Channel, f64)> + '_ {
        Channel::ALL.into_iter().map(|c| (c, self.get(c)))
    }

    pub fn all_zero(&self) -> bool {
        self.duties.iter().all(|&d| d == 0.0)
    }
}

/// Clamp a requested duty to [0, 100]; NaN becomes 0.
#[inline]
pub fn clamp_duty(v: f64) -> f64 {
    clamp_or_floor(v, DUTY_MIN, DUTY_MAX)
}

pub struct ActuatorDriver<B: PwmBus> {
    bus: B,
    pins: ChannelPins,
    state: DeviceState,
    shut_down: bool,
}

impl<B: PwmBus> ActuatorDriver<B> {
    /// Claim every channel and drive it to 0%.
    pub fn start(mut bus: B, pins: ChannelPins) -> Result<Self, StartupError> {
        let mut claimed: Vec<u8> = Vec::with_capacity(Channel::ALL.len());
        for channel in Channel::ALL {
            let pin = channel.pin(&pins);
            let step = bus
                .claim(pin)
                .map_err(|e| StartupError::Claim {
                    channel,
                    pin,
                    reason: e.to_string(),
                })
                .and_then(|()| {
                    claimed.push(pin);
                    bus.write(pin, pins.frequency_hz, 0.0)
                        .map_err(|e| StartupError::Zero {
                            channel,
                            pin,
                            reason: e.to_string(),
                        })
                });
            if let Err(err) = step {
                error!(%err, "actuator start-up failed; releasing claimed pins");
                for &p in claimed.iter().rev() {
                    bus.release(p);
                }
                bus.close();
                return Err(err);
            }
            debug!(%channel, pin, "channel claimed at 0%");
        }
        info!(frequency_hz = pins.frequency_hz, "actuator driver started");
        Ok(Self {
            bus,
            pins,
            state: DeviceState::default(),
            shut_down: false,
        })
    }

    /// Clamp `value` and write it to `channel`. The clamp is recorded in the
    /// device state whether or not the hardware write succeeds.
    pub fn set_duty_cycle(&mut self, channel: Channel, value: f64) -> Result<f64, FrothError> {
        if self.shut_down {
            return Err(FrothError::State("actuator driver is shut down".into()));
        }
        let duty = self.state.set(channel, value);
        if duty != value && !value.is_nan() {
            debug!(%channel, requested = value, applied = duty, "duty clamped");
        }
        let pin = channel.pin(&self.pins);
        match self.bus.write(pin, self.pins.frequency_hz, duty as f32) {
            Ok(()) => Ok(duty),
            Err(e) => {
                let mapped = map_hw_error(&*e);
                warn!(%channel, pin, error = %mapped, "duty write failed");
                Err(mapped)
            }
        }
    }

    /// Force every channel to 0%. Each channel is attempted regardless of
    /// earlier failures; returns the channels whose write failed.
    pub fn stop_all(&mut self) -> Vec<Channel> {
        let mut failed = Vec::new();
        for channel in Channel::ALL {
            self.state.set(channel, 0.0);
            if self.shut_down {
                continue;
            }
            let pin = channel.pin(&self.pins);
            if let Err(e) = self.bus.write(pin, self.pins.frequency_hz, 0.0) {
                error!(%channel, pin, error = %e, "failed to stop channel");
                failed.push(channel);
            }
        }
        if failed.is_empty() {
            debug!("all channels stopped");
        }
        failed
    }

    /// Stop all channels, release the pins and close the bus. Idempotent;
    /// returns the channels that could not be zeroed on the first call.
    pub fn shutdown(&mut self) -> Vec<Channel> {
        if self.shut_down {
            return Vec::new();
        }
        let failed = self.stop_all();
        for channel in Channel::ALL {
            self.bus.release(channel.pin(&self.pins));
        }
        self.bus.close();
        self.shut_down = true;
        if failed.is_empty() {
            info!("actuator driver shut down");
        } else {
            warn!(?failed, "actuator driver shut down with failed channels");
        }
        failed
    }

    pub fn device_state(&self) -> DeviceState {
        self.state
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}

impl<B: PwmBus> Drop for ActuatorDriver<B> {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

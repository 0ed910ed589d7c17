//! Frame source: camera lifecycle, typed read failures and health tracking.
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use froth_traits::{Camera, Clock, MonotonicClock};
use image::RgbImage;
use tracing::{debug, info, warn};

use crate::config::SourceCfg;
use crate::error::{AcquisitionError, FrothError};
use crate::hw_error::map_hw_error;

/// Reads kept for the frame-rate estimate.
pub const RATE_WINDOW: usize = 30;
/// No successful read for this long makes the source unhealthy.
pub const STALE_AFTER: Duration = Duration::from_secs(5);
/// Minimum acceptable rate once the window has filled.
pub const MIN_RATE_HZ: f64 = 5.0;

#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub captured_at: Instant,
    /// Monotonic per source, starting at 1.
    pub seq: u64,
}

pub struct FrameSource<C: Camera> {
    camera: C,
    cfg: SourceCfg,
    clock: Arc<dyn Clock + Send + Sync>,
    open: bool,
    seq: u64,
    last_success: Option<Instant>,
    read_times: VecDeque<Instant>,
}

impl<C: Camera> FrameSource<C> {
    pub fn new(camera: C, cfg: SourceCfg) -> Self {
        Self::with_clock(camera, cfg, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(camera: C, cfg: SourceCfg, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        Self {
            camera,
            cfg,
            clock,
            open: false,
            seq: 0,
            last_success: None,
            read_times: VecDeque::with_capacity(RATE_WINDOW),
        }
    }

    /// Open the camera, retrying with backoff. Each attempt must also
    /// deliver a test frame.
    pub fn open(&mut self) -> Result<(), AcquisitionError> {
        let attempts = self.cfg.max_retries.max(1);
        let mut reason = String::new();
        for attempt in 1..=attempts {
            match self.attempt_open() {
                Ok(()) => {
                    info!(attempt, "camera opened");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "camera open attempt failed");
                    reason = e;
                    if attempt < attempts {
                        self.clock.sleep(self.cfg.retry_backoff);
                    }
                }
            }
        }
        Err(AcquisitionError::OpenFailed { attempts, reason })
    }

    /// One open attempt without backoff; used by the sense loop after a
    /// failed read closed the source.
    pub fn try_reopen(&mut self) -> Result<(), AcquisitionError> {
        self.attempt_open()
            .map_err(|reason| AcquisitionError::OpenFailed {
                attempts: 1,
                reason,
            })
            .inspect(|_| info!("camera reopened"))
    }

    fn attempt_open(&mut self) -> Result<(), String> {
        self.camera.open().map_err(|e| map_hw_error(&*e).to_string())?;
        match self.camera.grab(self.cfg.read_timeout) {
            Ok(img) if img.width() > 0 && img.height() > 0 => {
                self.open = true;
                self.last_success = Some(self.clock.now());
                self.read_times.clear();
                Ok(())
            }
            Ok(_) => {
                self.camera.release();
                Err("test frame is empty".into())
            }
            Err(e) => {
                self.camera.release();
                Err(format!("test frame: {}", map_hw_error(&*e)))
            }
        }
    }

    /// Fetch one frame.
    ///
    /// A camera timeout is `Stale` and leaves the source open; any other
    /// camera error is `ReadFailed` and closes it.
    pub fn read(&mut self) -> Result<Frame, AcquisitionError> {
        if !self.open {
            return Err(AcquisitionError::NotOpen);
        }
        match self.camera.grab(self.cfg.read_timeout) {
            Ok(image) if image.width() == 0 || image.height() == 0 => {
                Err(AcquisitionError::Stale("empty frame".into()))
            }
            Ok(image) => {
                let now = self.clock.now();
                self.seq += 1;
                self.last_success = Some(now);
                if self.read_times.len() == RATE_WINDOW {
                    self.read_times.pop_front();
                }
                self.read_times.push_back(now);
                Ok(Frame {
                    image,
                    captured_at: now,
                    seq: self.seq,
                })
            }
            Err(e) => match map_hw_error(&*e) {
                FrothError::Timeout => Err(AcquisitionError::Stale("camera timeout".into())),
                other => {
                    warn!(error = %other, "frame read failed; closing camera");
                    self.open = false;
                    self.camera.release();
                    Err(AcquisitionError::ReadFailed(other.to_string()))
                }
            },
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Open, fresh within `STALE_AFTER`, and not running below `MIN_RATE_HZ`
    /// once more than `RATE_WINDOW` frames have been read.
    pub fn is_healthy(&self) -> bool {
        if !self.open {
            return false;
        }
        let fresh = self
            .last_success
            .is_some_and(|t| self.clock.now().saturating_duration_since(t) <= STALE_AFTER);
        if !fresh {
            return false;
        }
        if self.seq > RATE_WINDOW as u64 {
            let fps = self.frame_rate();
            if fps < MIN_RATE_HZ {
                debug!(fps, "frame rate below minimum");
                return false;
            }
        }
        true
    }

    /// Frames per second over the read window; 0 with fewer than two reads.
    pub fn frame_rate(&self) -> f64 {
        let (Some(first), Some(last)) = (self.read_times.front(), self.read_times.back()) else {
            return 0.0;
        };
        if self.read_times.len() < 2 {
            return 0.0;
        }
        let span = last.saturating_duration_since(*first).as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }
        (self.read_times.len() - 1) as f64 / span
    }

    /// Frames delivered since construction.
    pub fn frame_count(&self) -> u64 {
        self.seq
    }

    /// Release the camera. Safe to call any number of times.
    pub fn release(&mut self) {
        if self.open {
            self.open = false;
            self.camera.release();
            info!(frames = self.seq, "camera released");
        }
    }

    pub fn camera(&self) -> &C {
        &self.camera
    }
}

impl<C: Camera> Drop for FrameSource<C> {
    fn drop(&mut self) {
        self.release();
    }
}

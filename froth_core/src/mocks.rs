//! Test and helper mocks for froth_core

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use froth_traits::{Contour, DistanceImage, LabelImage, Segmentation};
use image::{GrayImage, RgbImage};

use crate::analyze::FrothMetrics;
use crate::pipeline::MetricsSink;

/// A camera that never opens; drives the frame source's retry path.
pub struct NoopCamera;

impl froth_traits::Camera for NoopCamera {
    fn open(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Err(Box::new(std::io::Error::other("noop camera")))
    }

    fn grab(
        &mut self,
        _timeout: Duration,
    ) -> Result<RgbImage, Box<dyn std::error::Error + Send + Sync>> {
        Err(Box::new(std::io::Error::other("noop camera")))
    }

    fn release(&mut self) {}
}

/// Segmentation that sees no foreground, or fails every call when `fail`
/// is set.
#[derive(Debug, Default, Clone, Copy)]
pub struct StubSegmentation {
    pub fail: bool,
}

impl StubSegmentation {
    fn check(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if self.fail {
            Err("stub segmentation failure".into())
        } else {
            Ok(())
        }
    }
}

impl Segmentation for StubSegmentation {
    fn distance_transform(
        &self,
        mask: &GrayImage,
    ) -> Result<DistanceImage, Box<dyn std::error::Error + Send + Sync>> {
        self.check()?;
        Ok(DistanceImage::new(mask.width(), mask.height()))
    }

    fn label_components(
        &self,
        mask: &GrayImage,
    ) -> Result<(LabelImage, u32), Box<dyn std::error::Error + Send + Sync>> {
        self.check()?;
        Ok((LabelImage::new(mask.width(), mask.height()), 0))
    }

    fn dilate(
        &self,
        mask: &GrayImage,
        _kernel: u32,
        _iterations: u32,
    ) -> Result<GrayImage, Box<dyn std::error::Error + Send + Sync>> {
        self.check()?;
        Ok(mask.clone())
    }

    fn segment(
        &self,
        _image: &RgbImage,
        markers: &LabelImage,
    ) -> Result<LabelImage, Box<dyn std::error::Error + Send + Sync>> {
        self.check()?;
        Ok(markers.clone())
    }

    fn external_contours(
        &self,
        _mask: &GrayImage,
    ) -> Result<Vec<Contour>, Box<dyn std::error::Error + Send + Sync>> {
        self.check()?;
        Ok(Vec::new())
    }
}

/// Sink that remembers the sequence number of every record, and optionally
/// fails each write after recording it.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    seen: Arc<Mutex<Vec<u64>>>,
    pub fail: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn seen(&self) -> Vec<u64> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl MetricsSink for RecordingSink {
    fn record(
        &mut self,
        metrics: &FrothMetrics,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(metrics.seq);
        if self.fail {
            Err("recording sink configured to fail".into())
        } else {
            Ok(())
        }
    }
}

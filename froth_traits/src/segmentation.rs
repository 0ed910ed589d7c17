//! Segmentation capability set consumed by the blob detector.
//!
//! Image conventions:
//! - masks are `GrayImage`, foreground is any non-zero pixel
//! - label images are `i32`; 0 is "unknown", positive values are regions and
//!   `WATERSHED_BOUNDARY` marks pixels that separate two regions
use image::{GrayImage, ImageBuffer, Luma, RgbImage};

/// Per-pixel region labels.
pub type LabelImage = ImageBuffer<Luma<i32>, Vec<i32>>;

/// Per-pixel Euclidean distances.
pub type DistanceImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Label written by `segment` on pixels that belong to no region.
pub const WATERSHED_BOUNDARY: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

/// Closed outer boundary of one connected foreground region, in tracing order.
#[derive(Debug, Clone, Default)]
pub struct Contour {
    pub points: Vec<Point>,
}

pub trait Segmentation {
    /// Euclidean distance from every foreground pixel to the nearest background
    /// pixel (0 on background).
    fn distance_transform(
        &self,
        mask: &GrayImage,
    ) -> Result<DistanceImage, Box<dyn std::error::Error + Send + Sync>>;

    /// Label 8-connected foreground components. Background is 0 and components
    /// are numbered `1..=n`; returns the label image and `n`.
    fn label_components(
        &self,
        mask: &GrayImage,
    ) -> Result<(LabelImage, u32), Box<dyn std::error::Error + Send + Sync>>;

    /// Dilate `mask` `iterations` times with a `kernel`x`kernel` square
    /// structuring element. `kernel` is odd; 1 leaves the mask unchanged.
    fn dilate(
        &self,
        mask: &GrayImage,
        kernel: u32,
        iterations: u32,
    ) -> Result<GrayImage, Box<dyn std::error::Error + Send + Sync>>;

    /// Marker-based watershed over a colour image.
    ///
    /// `markers` holds seed labels (> 0) and unknown pixels (0). The returned
    /// image assigns every unknown pixel to a seed label or to
    /// `WATERSHED_BOUNDARY`.
    fn segment(
        &self,
        image: &RgbImage,
        markers: &LabelImage,
    ) -> Result<LabelImage, Box<dyn std::error::Error + Send + Sync>>;

    /// Outermost contours of the foreground regions (holes ignored).
    fn external_contours(
        &self,
        mask: &GrayImage,
    ) -> Result<Vec<Contour>, Box<dyn std::error::Error + Send + Sync>>;
}

impl<T: Segmentation + ?Sized> Segmentation for Box<T> {
    fn distance_transform(
        &self,
        mask: &GrayImage,
    ) -> Result<DistanceImage, Box<dyn std::error::Error + Send + Sync>> {
        (**self).distance_transform(mask)
    }
    fn label_components(
        &self,
        mask: &GrayImage,
    ) -> Result<(LabelImage, u32), Box<dyn std::error::Error + Send + Sync>> {
        (**self).label_components(mask)
    }
    fn dilate(
        &self,
        mask: &GrayImage,
        kernel: u32,
        iterations: u32,
    ) -> Result<GrayImage, Box<dyn std::error::Error + Send + Sync>> {
        (**self).dilate(mask, kernel, iterations)
    }
    fn segment(
        &self,
        image: &RgbImage,
        markers: &LabelImage,
    ) -> Result<LabelImage, Box<dyn std::error::Error + Send + Sync>> {
        (**self).segment(image, markers)
    }
    fn external_contours(
        &self,
        mask: &GrayImage,
    ) -> Result<Vec<Contour>, Box<dyn std::error::Error + Send + Sync>> {
        (**self).external_contours(mask)
    }
}

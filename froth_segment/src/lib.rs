//! Segmentation collaborator backed by `imageproc`.
//!
//! Implements the `froth_traits::Segmentation` capability set: Euclidean
//! distance transform, 8-connected component labelling, square dilation of
//! any odd size,
//! marker watershed and outer contour tracing.
mod watershed;

use froth_traits::{Contour, DistanceImage, LabelImage, Point, Segmentation};
use image::{GrayImage, Luma, RgbImage};
use imageproc::contours::BorderType;
use imageproc::distance_transform::Norm;
use imageproc::region_labelling::{Connectivity, connected_components};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SegmentError {
    #[error("empty image")]
    Empty,
    #[error("structuring element must be odd, got {0}")]
    EvenKernel(u32),
    #[error("size mismatch: image {image:?}, markers {markers:?}")]
    SizeMismatch {
        image: (u32, u32),
        markers: (u32, u32),
    },
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ImageprocSegmentation;

impl ImageprocSegmentation {
    pub fn new() -> Self {
        Self
    }
}

fn non_empty(w: u32, h: u32) -> Result<(), SegmentError> {
    if w == 0 || h == 0 {
        Err(SegmentError::Empty)
    } else {
        Ok(())
    }
}

impl Segmentation for ImageprocSegmentation {
    fn distance_transform(
        &self,
        mask: &GrayImage,
    ) -> Result<DistanceImage, Box<dyn std::error::Error + Send + Sync>> {
        let (w, h) = mask.dimensions();
        non_empty(w, h)?;
        // imageproc measures distance to the nearest non-zero pixel, so feed it
        // the background as foreground.
        let mut inverted = mask.clone();
        for p in inverted.pixels_mut() {
            p.0[0] = if p.0[0] == 0 { 255 } else { 0 };
        }
        let squared = imageproc::distance_transform::euclidean_squared_distance_transform(&inverted);
        // A mask with no background has no finite distances; cap at the diagonal.
        let cap = (f64::from(w).hypot(f64::from(h))) as f32;
        let mut out = DistanceImage::new(w, h);
        for (dst, src) in out.pixels_mut().zip(squared.pixels()) {
            let d = (src.0[0] as f64).sqrt() as f32;
            dst.0[0] = if d.is_finite() { d.min(cap) } else { cap };
        }
        Ok(out)
    }

    fn label_components(
        &self,
        mask: &GrayImage,
    ) -> Result<(LabelImage, u32), Box<dyn std::error::Error + Send + Sync>> {
        let (w, h) = mask.dimensions();
        non_empty(w, h)?;
        let labelled = connected_components(mask, Connectivity::Eight, Luma([0u8]));
        let mut out = LabelImage::new(w, h);
        let mut count = 0u32;
        for (dst, src) in out.pixels_mut().zip(labelled.pixels()) {
            let l = src.0[0];
            count = count.max(l);
            dst.0[0] = i32::try_from(l)?;
        }
        Ok((out, count))
    }

    fn dilate(
        &self,
        mask: &GrayImage,
        kernel: u32,
        iterations: u32,
    ) -> Result<GrayImage, Box<dyn std::error::Error + Send + Sync>> {
        let (w, h) = mask.dimensions();
        non_empty(w, h)?;
        if kernel % 2 == 0 {
            return Err(Box::new(SegmentError::EvenKernel(kernel)));
        }
        let radius = u8::try_from(kernel / 2)?;
        let mut out = mask.clone();
        if radius == 0 {
            return Ok(out);
        }
        for _ in 0..iterations {
            out = imageproc::morphology::dilate(&out, Norm::LInf, radius);
        }
        Ok(out)
    }

    fn segment(
        &self,
        image: &RgbImage,
        markers: &LabelImage,
    ) -> Result<LabelImage, Box<dyn std::error::Error + Send + Sync>> {
        let (w, h) = markers.dimensions();
        non_empty(w, h)?;
        if image.dimensions() != markers.dimensions() {
            return Err(Box::new(SegmentError::SizeMismatch {
                image: image.dimensions(),
                markers: markers.dimensions(),
            }));
        }
        Ok(watershed::flood(image, markers))
    }

    fn external_contours(
        &self,
        mask: &GrayImage,
    ) -> Result<Vec<Contour>, Box<dyn std::error::Error + Send + Sync>> {
        let (w, h) = mask.dimensions();
        non_empty(w, h)?;
        let contours = imageproc::contours::find_contours::<i32>(mask)
            .into_iter()
            .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
            .map(|c| Contour {
                points: c.points.iter().map(|p| Point { x: p.x, y: p.y }).collect(),
            })
            .collect::<Vec<_>>();
        tracing::trace!(contours = contours.len(), "outer contours traced");
        Ok(contours)
    }
}

//! Blob detector: separates touching bubbles with a marker watershed and
//! measures each one.
//!
//! ```text
//! mask ─ distance ─ > t·max ─ seeds ─ label+1 ─┐
//!   └─ dilate(k)×N ─ background ─ − seeds ─ unknown=0 ─ markers ─ watershed(frame)
//!                                                                   │
//!                    labels > 1 ─ blob mask ─ outer contours ─ area/perimeter filters
//! ```
//!
//! Detection never fails: any collaborator error or bad input yields an
//! empty `Detection` and a log line.
use std::ops::Deref;

use froth_traits::{Contour, DistanceImage, LabelImage, Segmentation};
use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_circle_mut;
use tracing::{debug, warn};

use crate::config::DetectorCfg;
use crate::geometry::{
    circularity, contour_area, contour_perimeter, equivalent_diameter, min_enclosing_circle,
};
use crate::util::{mean, std_dev};

/// Outline colour of detected bubbles in annotated frames.
pub const OUTLINE: Rgb<u8> = Rgb([0, 255, 0]);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Blob {
    /// Minimum enclosing circle centre, pixels.
    pub center: (f32, f32),
    /// Minimum enclosing circle radius, pixels.
    pub radius: f32,
    /// Equivalent diameter `2·sqrt(area/π)`.
    pub diameter: f32,
    pub area: f64,
    pub perimeter: f64,
    pub circularity: f64,
}

/// Blobs that passed both the area and the circularity filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlobSet(Vec<Blob>);

impl BlobSet {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Keep only the blobs that pass `cfg`'s area and circularity filters.
    pub fn filtered(blobs: impl IntoIterator<Item = Blob>, cfg: &DetectorCfg) -> Self {
        Self(
            blobs
                .into_iter()
                .filter(|b| b.area >= cfg.min_area && b.circularity >= cfg.circularity_threshold)
                .collect(),
        )
    }

    pub fn diameters(&self) -> Vec<f64> {
        self.0.iter().map(|b| f64::from(b.diameter)).collect()
    }

    pub fn into_vec(self) -> Vec<Blob> {
        self.0
    }
}

impl Deref for BlobSet {
    type Target = [Blob];

    fn deref(&self) -> &[Blob] {
        &self.0
    }
}

/// Intermediate images kept for inspection.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    pub distance: DistanceImage,
    pub seeds: GrayImage,
    pub unknown: GrayImage,
    pub markers: LabelImage,
    pub labels: LabelImage,
    pub blob_mask: GrayImage,
}

#[derive(Debug, Clone, Default)]
pub struct Detection {
    pub blobs: BlobSet,
    /// `None` when detection bailed out early.
    pub diagnostics: Option<Diagnostics>,
}

/// Aggregate statistics over a blob set.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BlobSummary {
    pub count: usize,
    pub mean_diameter: f64,
    pub std_diameter: f64,
    pub min_diameter: f64,
    pub max_diameter: f64,
    pub mean_area: f64,
    pub mean_circularity: f64,
}

impl BlobSummary {
    pub fn of(blobs: &BlobSet) -> Self {
        if blobs.is_empty() {
            return Self::default();
        }
        let d = blobs.diameters();
        let areas: Vec<f64> = blobs.iter().map(|b| b.area).collect();
        let circ: Vec<f64> = blobs.iter().map(|b| b.circularity).collect();
        Self {
            count: blobs.len(),
            mean_diameter: mean(&d),
            std_diameter: std_dev(&d),
            min_diameter: d.iter().copied().fold(f64::INFINITY, f64::min),
            max_diameter: d.iter().copied().fold(0.0, f64::max),
            mean_area: mean(&areas),
            mean_circularity: mean(&circ),
        }
    }
}

pub struct BlobDetector<S: Segmentation> {
    seg: S,
    cfg: DetectorCfg,
}

impl<S: Segmentation> BlobDetector<S> {
    pub fn new(seg: S, cfg: DetectorCfg) -> Self {
        Self { seg, cfg }
    }

    pub fn config(&self) -> &DetectorCfg {
        &self.cfg
    }

    pub fn segmentation(&self) -> &S {
        &self.seg
    }

    /// Detect blobs in `mask`, using `frame` as the watershed relief.
    pub fn detect(&self, mask: &GrayImage, frame: &RgbImage) -> Detection {
        match self.try_detect(mask, frame) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "blob detection failed; reporting no blobs");
                Detection::default()
            }
        }
    }

    pub fn summary(&self, detection: &Detection) -> BlobSummary {
        BlobSummary::of(&detection.blobs)
    }

    /// Copy of `frame` with every watershed region tinted green and a
    /// two-pixel outline on each blob's enclosing circle. Regions are only
    /// drawn when the label image matches the frame size.
    pub fn annotate(&self, detection: &Detection, frame: &RgbImage) -> RgbImage {
        let mut out = frame.clone();
        let labels = detection
            .diagnostics
            .as_ref()
            .map(|d| &d.labels)
            .filter(|l| l.dimensions() == out.dimensions());
        if let Some(labels) = labels {
            for (p, l) in out.pixels_mut().zip(labels.pixels()) {
                if l[0] > 1 {
                    p[0] /= 2;
                    p[1] = p[1] / 2 + 128;
                    p[2] /= 2;
                }
            }
        }
        for b in detection.blobs.iter() {
            let centre = (b.center.0.round() as i32, b.center.1.round() as i32);
            let r = b.radius.round() as i32;
            draw_hollow_circle_mut(&mut out, centre, r, OUTLINE);
            if r > 1 {
                draw_hollow_circle_mut(&mut out, centre, r - 1, OUTLINE);
            }
        }
        out
    }

    fn try_detect(
        &self,
        mask: &GrayImage,
        frame: &RgbImage,
    ) -> Result<Detection, Box<dyn std::error::Error + Send + Sync>> {
        let (w, h) = mask.dimensions();
        if w == 0 || h == 0 {
            return Err("empty mask".into());
        }
        if frame.dimensions() != (w, h) {
            return Err(format!(
                "mask is {w}x{h} but frame is {}x{}",
                frame.width(),
                frame.height()
            )
            .into());
        }

        let distance = self.seg.distance_transform(mask)?;
        let peak = distance.pixels().map(|p| p[0]).fold(0.0f32, f32::max);
        if peak <= 0.0 {
            debug!("mask has no foreground");
            return Ok(Detection::default());
        }
        let cut = self.cfg.distance_threshold * peak;
        let seeds = GrayImage::from_fn(w, h, |x, y| {
            Luma([if distance.get_pixel(x, y)[0] > cut { 255 } else { 0 }])
        });

        let background = self.seg.dilate(
            mask,
            self.cfg.background_kernel,
            self.cfg.dilation_iterations,
        )?;
        let unknown = GrayImage::from_fn(w, h, |x, y| {
            Luma([background.get_pixel(x, y)[0].saturating_sub(seeds.get_pixel(x, y)[0])])
        });

        let (mut markers, n_seeds) = self.seg.label_components(&seeds)?;
        for (m, u) in markers.pixels_mut().zip(unknown.pixels()) {
            m[0] = if u[0] == 255 { 0 } else { m[0] + 1 };
        }

        let labels = self.seg.segment(frame, &markers)?;
        let blob_mask = GrayImage::from_fn(w, h, |x, y| {
            Luma([if labels.get_pixel(x, y)[0] > 1 { 255 } else { 0 }])
        });
        let contours = self.seg.external_contours(&blob_mask)?;
        let blobs = self.measure(&contours);
        debug!(
            seeds = n_seeds,
            contours = contours.len(),
            blobs = blobs.len(),
            "blob detection"
        );

        Ok(Detection {
            blobs,
            diagnostics: Some(Diagnostics {
                distance,
                seeds,
                unknown,
                markers,
                labels,
                blob_mask,
            }),
        })
    }

    fn measure(&self, contours: &[Contour]) -> BlobSet {
        let mut out = Vec::with_capacity(contours.len());
        for c in contours {
            let area = contour_area(&c.points);
            if area < self.cfg.min_area {
                continue;
            }
            let perimeter = contour_perimeter(&c.points);
            let circ = circularity(area, perimeter);
            if circ < self.cfg.circularity_threshold {
                continue;
            }
            let Some(enclosing) = min_enclosing_circle(&c.points) else {
                continue;
            };
            out.push(Blob {
                center: (enclosing.x as f32, enclosing.y as f32),
                radius: enclosing.r as f32,
                diameter: equivalent_diameter(area) as f32,
                area,
                perimeter,
                circularity: circ,
            });
        }
        BlobSet(out)
    }
}

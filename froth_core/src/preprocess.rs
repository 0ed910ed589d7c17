//! Per-frame preprocessing: grayscale, blur, Otsu threshold, opening, closing.
//!
//! Stateless apart from its configuration. Every stage is returned so the
//! diagnostics view can show where a mask went wrong.
use image::{GrayImage, RgbImage, imageops};
use imageproc::contrast::otsu_level;
use imageproc::distance_transform::Norm;
use imageproc::filter::gaussian_blur_f32;
use imageproc::morphology;
use tracing::{debug, warn};

use crate::config::PreprocessCfg;

#[derive(Debug, Clone)]
pub struct Preprocessed {
    pub gray: GrayImage,
    pub blurred: GrayImage,
    pub binary: GrayImage,
    pub opened: GrayImage,
    /// Final foreground mask.
    pub closed: GrayImage,
    /// Otsu level used for `binary`.
    pub threshold: u8,
}

#[derive(Debug, Clone, Default)]
pub struct Preprocessor {
    cfg: PreprocessCfg,
}

impl Preprocessor {
    pub fn new(cfg: PreprocessCfg) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &PreprocessCfg {
        &self.cfg
    }

    /// Run the whole chain. Returns `None` for an empty image.
    pub fn process(&self, image: &RgbImage) -> Option<Preprocessed> {
        if image.width() == 0 || image.height() == 0 {
            warn!("empty image handed to preprocessor");
            return None;
        }
        let gray = imageops::grayscale(image);
        let blurred = match blur_sigma(self.cfg.blur_kernel) {
            Some(sigma) => gaussian_blur_f32(&gray, sigma),
            None => gray.clone(),
        };
        let threshold = otsu_level(&blurred);
        let binary = binarize(&blurred, threshold, self.cfg.invert);

        let radius = morph_radius(self.cfg.morph_kernel);
        let opened = open(&binary, radius, self.cfg.opening_iterations);
        let closed = close(&opened, radius, self.cfg.closing_iterations);
        debug!(threshold, "frame preprocessed");

        Some(Preprocessed {
            gray,
            blurred,
            binary,
            opened,
            closed,
            threshold,
        })
    }

    /// Final mask only; an all-zero mask of the frame's size when the input
    /// is empty.
    pub fn mask(&self, image: &RgbImage) -> GrayImage {
        self.process(image)
            .map(|p| p.closed)
            .unwrap_or_else(|| GrayImage::new(image.width(), image.height()))
    }
}

/// Gaussian sigma for a kernel size, using the usual derivation
/// `0.3 * ((k - 1) * 0.5 - 1) + 0.8`. Kernels of 1 or less disable the blur.
fn blur_sigma(kernel: u32) -> Option<f32> {
    if kernel <= 1 {
        return None;
    }
    let k = kernel as f32;
    Some(0.3 * ((k - 1.0) * 0.5 - 1.0) + 0.8)
}

/// Half-width of the square structuring element.
fn morph_radius(kernel: u32) -> u8 {
    u8::try_from(kernel / 2).unwrap_or(u8::MAX)
}

fn binarize(img: &GrayImage, t: u8, invert: bool) -> GrayImage {
    let mut out = img.clone();
    for p in out.pixels_mut() {
        let fg = if invert { p[0] <= t } else { p[0] > t };
        p[0] = if fg { 255 } else { 0 };
    }
    out
}

fn open(mask: &GrayImage, radius: u8, iterations: u32) -> GrayImage {
    if radius == 0 {
        return mask.clone();
    }
    let mut out = mask.clone();
    for _ in 0..iterations {
        out = morphology::erode(&out, Norm::LInf, radius);
    }
    for _ in 0..iterations {
        out = morphology::dilate(&out, Norm::LInf, radius);
    }
    out
}

fn close(mask: &GrayImage, radius: u8, iterations: u32) -> GrayImage {
    if radius == 0 {
        return mask.clone();
    }
    let mut out = mask.clone();
    for _ in 0..iterations {
        out = morphology::dilate(&out, Norm::LInf, radius);
    }
    for _ in 0..iterations {
        out = morphology::erode(&out, Norm::LInf, radius);
    }
    out
}

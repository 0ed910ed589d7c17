//! Camera that replays still images from disk.
//!
//! Point it at a single image or at a directory; directory entries with a
//! supported extension are replayed in name order, looping forever.
use std::path::{Path, PathBuf};
use std::time::Duration;

use froth_traits::Camera;
use image::RgbImage;

use crate::error::HwError;

const EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

pub struct ImageFileCamera {
    source: PathBuf,
    frames: Vec<PathBuf>,
    next: usize,
    open: bool,
}

impl ImageFileCamera {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            frames: Vec::new(),
            next: 0,
            open: false,
        }
    }

    fn scan(path: &Path) -> crate::error::Result<Vec<PathBuf>> {
        if path.is_file() {
            return Ok(vec![path.to_path_buf()]);
        }
        let mut frames: Vec<PathBuf> = std::fs::read_dir(path)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            })
            .collect();
        frames.sort();
        if frames.is_empty() {
            return Err(HwError::DeviceUnavailable(format!(
                "no images under {}",
                path.display()
            )));
        }
        Ok(frames)
    }
}

impl Camera for ImageFileCamera {
    fn open(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.frames = Self::scan(&self.source)?;
        self.next = 0;
        self.open = true;
        tracing::info!(source = %self.source.display(), frames = self.frames.len(), "image replay opened");
        Ok(())
    }

    fn grab(
        &mut self,
        _timeout: Duration,
    ) -> Result<RgbImage, Box<dyn std::error::Error + Send + Sync>> {
        if !self.open || self.frames.is_empty() {
            return Err(Box::new(HwError::DeviceUnavailable(
                "image replay not open".into(),
            )));
        }
        let path = &self.frames[self.next % self.frames.len()];
        self.next = self.next.wrapping_add(1);
        let img = image::open(path).map_err(|e| HwError::Decode(format!("{}: {e}", path.display())))?;
        Ok(img.to_rgb8())
    }

    fn release(&mut self) {
        self.open = false;
        self.frames.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn replays_directory_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        RgbImage::from_pixel(4, 4, Rgb([10, 10, 10]))
            .save(dir.path().join("a.png"))
            .unwrap();
        RgbImage::from_pixel(4, 4, Rgb([200, 200, 200]))
            .save(dir.path().join("b.png"))
            .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "skip me").unwrap();

        let mut cam = ImageFileCamera::new(dir.path());
        cam.open().unwrap();
        let t = Duration::from_millis(1);
        assert_eq!(cam.grab(t).unwrap().get_pixel(0, 0).0, [10, 10, 10]);
        assert_eq!(cam.grab(t).unwrap().get_pixel(0, 0).0, [200, 200, 200]);
        assert_eq!(cam.grab(t).unwrap().get_pixel(0, 0).0, [10, 10, 10]);
    }

    #[test]
    fn empty_directory_does_not_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut cam = ImageFileCamera::new(dir.path());
        assert!(cam.open().is_err());
        assert!(cam.grab(Duration::from_millis(1)).is_err());
    }
}

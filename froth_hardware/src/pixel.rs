//! Decoding of raw capture buffers into RGB frames.
use std::io::Cursor;

use image::{ImageFormat, ImageReader, RgbImage};

use crate::error::{HwError, Result};

/// Packed YUYV 4:2:2 (`Y0 U Y1 V` per pixel pair), BT.601 studio range.
/// Trailing bytes past `width * height * 2` are ignored.
pub fn yuyv_to_rgb(width: u32, height: u32, data: &[u8]) -> Result<RgbImage> {
    if width % 2 != 0 {
        return Err(HwError::Decode(format!("YUYV needs an even width, got {width}")));
    }
    let need = width as usize * height as usize * 2;
    if data.len() < need {
        return Err(HwError::Decode(format!(
            "YUYV buffer holds {} bytes, {width}x{height} needs {need}",
            data.len()
        )));
    }
    let mut rgb = Vec::with_capacity(need / 2 * 3);
    for px in data[..need].chunks_exact(4) {
        let (u, v) = (px[1], px[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(px[0], u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(px[2], u, v));
    }
    RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| HwError::Decode("YUYV frame size mismatch".into()))
}

fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = 1.164 * (f32::from(y) - 16.0);
    let d = f32::from(u) - 128.0;
    let e = f32::from(v) - 128.0;
    let px = |x: f32| x.round().clamp(0.0, 255.0) as u8;
    [
        px(c + 1.596 * e),
        px(c - 0.392 * d - 0.813 * e),
        px(c + 2.017 * d),
    ]
}

/// One Motion-JPEG frame.
pub fn mjpeg_to_rgb(data: &[u8]) -> Result<RgbImage> {
    let mut reader = ImageReader::new(Cursor::new(data));
    reader.set_format(ImageFormat::Jpeg);
    let img = reader.decode().map_err(|e| HwError::Decode(format!("MJPEG: {e}")))?;
    Ok(img.to_rgb8())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use rstest::rstest;

    #[rstest]
    #[case::black(16, 128, 128, [0, 0, 0])]
    #[case::white(235, 128, 128, [255, 255, 255])]
    #[case::mid_grey(126, 128, 128, [128, 128, 128])]
    fn neutral_chroma_is_grey(#[case] y: u8, #[case] u: u8, #[case] v: u8, #[case] want: [u8; 3]) {
        let frame = yuyv_to_rgb(2, 1, &[y, u, y, v]).unwrap();
        assert_eq!(*frame.get_pixel(0, 0), Rgb(want));
        assert_eq!(*frame.get_pixel(1, 0), Rgb(want));
    }

    #[test]
    fn pixel_pairs_share_chroma() {
        // strong red chroma, two different lumas
        let frame = yuyv_to_rgb(2, 1, &[81, 90, 145, 240]).unwrap();
        let (a, b) = (frame.get_pixel(0, 0), frame.get_pixel(1, 0));
        assert!(a[0] > a[1] && a[0] > a[2], "{a:?}");
        assert!(b[0] > a[0]);
    }

    #[test]
    fn short_or_odd_buffers_are_rejected() {
        assert!(matches!(yuyv_to_rgb(3, 1, &[0; 6]), Err(HwError::Decode(_))));
        assert!(matches!(yuyv_to_rgb(4, 2, &[0; 15]), Err(HwError::Decode(_))));
        // driver padding past the frame is fine
        assert!(yuyv_to_rgb(2, 2, &[16, 128, 16, 128, 16, 128, 16, 128, 0, 0]).is_ok());
    }

    #[test]
    fn mjpeg_frames_decode() {
        let src = RgbImage::from_pixel(16, 8, Rgb([180, 180, 180]));
        let mut jpeg = Vec::new();
        src.write_to(&mut Cursor::new(&mut jpeg), ImageFormat::Jpeg)
            .unwrap();
        let frame = mjpeg_to_rgb(&jpeg).unwrap();
        assert_eq!(frame.dimensions(), (16, 8));
        assert!(frame.pixels().all(|p| p[0].abs_diff(180) < 6));
        assert!(matches!(mjpeg_to_rgb(b"not a jpeg"), Err(HwError::Decode(_))));
    }
}

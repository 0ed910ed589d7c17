#![no_main]
use froth_core::{AnalyzerCfg, BlobDetector, DetectorCfg, FrothAnalyzer, Preprocessor};
use froth_segment::ImageprocSegmentation;
use image::RgbImage;
use libfuzzer_sys::arbitrary::{self, Arbitrary};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    width: u8,
    height: u8,
    pixels: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let (w, h) = (u32::from(input.width), u32::from(input.height));
    let mut buf = input.pixels;
    buf.resize((w * h * 3) as usize, 0);
    let Some(frame) = RgbImage::from_raw(w, h, buf) else {
        return;
    };
    let mut analyzer = FrothAnalyzer::new(
        Preprocessor::default(),
        BlobDetector::new(ImageprocSegmentation::new(), DetectorCfg::default()),
        AnalyzerCfg::default(),
    );
    let m = analyzer.analyze_frame(&frame, 1).metrics;
    assert!((0.0..=1.0).contains(&m.coverage_ratio));
    assert!((0.0..=1.0).contains(&m.froth_stability));
    assert!(m.temporal_variance >= 0.0);
});

use std::time::Duration;

use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use froth_core::{AnalyzerCfg, BlobDetector, DetectorCfg, FrothAnalyzer, Preprocessor};
use froth_hardware::sim::SimulatedCamera;
use froth_segment::ImageprocSegmentation;
use froth_traits::Camera;
use image::RgbImage;

// One synthetic froth frame per bubble count.
fn frame(width: u32, height: u32, bubbles: usize) -> RgbImage {
    let mut cam = SimulatedCamera::new(width, height, bubbles)
        .with_seed(0xC0FFEE)
        .with_radius_range(6, 14);
    cam.open().expect("sim camera opens");
    cam.grab(Duration::from_millis(10)).expect("sim frame")
}

pub fn bench_analyze_frame(c: &mut Criterion) {
    let mut g = c.benchmark_group("analyze_frame");
    // Allow quick tweaking without CLI flags (Criterion 0.5):
    //   BENCH_SAMPLE_SIZE=10 BENCH_MEAS_MS=50 cargo bench -p froth_core --bench detector
    if let Ok(ss) = std::env::var("BENCH_SAMPLE_SIZE") {
        if let Ok(n) = ss.parse::<usize>() {
            g.sample_size(n.max(10));
        }
    } else {
        g.sample_size(20);
    }
    if let Ok(ms) = std::env::var("BENCH_MEAS_MS")
        && let Ok(ms_u64) = ms.parse::<u64>()
    {
        g.measurement_time(Duration::from_millis(ms_u64));
    }

    for &bubbles in &[10usize, 40, 120] {
        let img = frame(320, 240, bubbles);
        g.bench_function(format!("bubbles_{bubbles}"), |b| {
            let mut analyzer = FrothAnalyzer::new(
                Preprocessor::default(),
                BlobDetector::new(ImageprocSegmentation::new(), DetectorCfg::default()),
                AnalyzerCfg::default(),
            );
            let mut seq = 0u64;
            b.iter(|| {
                seq += 1;
                let a = analyzer.analyze_frame(black_box(&img), seq);
                black_box(a.metrics.bubble_count);
            });
        });
    }
    g.finish();
}

pub fn bench_preprocess(c: &mut Criterion) {
    let img = frame(640, 480, 80);
    let pre = Preprocessor::default();
    c.bench_function("preprocess_640x480", |b| {
        b.iter_batched(
            || img.clone(),
            |i| black_box(pre.mask(&i)),
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(detector, bench_analyze_frame, bench_preprocess);
criterion_main!(detector);

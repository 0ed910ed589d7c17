//! Marker-controlled watershed over an RGB image.
//!
//! Priority flood from the seed labels: unknown pixels adjacent to a seed are
//! queued with the colour distance to that seed, the cheapest pixel is
//! settled next, and a pixel that touches two different labels becomes a
//! boundary. Ties are broken first-in first-out.
use std::cmp::Reverse;
use std::collections::BinaryHeap;

use froth_traits::{LabelImage, WATERSHED_BOUNDARY};
use image::{Rgb, RgbImage};

const IN_QUEUE: i32 = -2;

/// Largest absolute per-channel difference.
#[inline]
fn colour_distance(a: &Rgb<u8>, b: &Rgb<u8>) -> u8 {
    a.0.iter()
        .zip(b.0.iter())
        .map(|(&x, &y)| x.abs_diff(y))
        .max()
        .unwrap_or(0)
}

struct Flood<'a> {
    image: &'a RgbImage,
    labels: Vec<i32>,
    width: usize,
    height: usize,
    heap: BinaryHeap<Reverse<(u8, u64, usize)>>,
    seq: u64,
}

impl Flood<'_> {
    fn neighbours(&self, idx: usize) -> impl Iterator<Item = usize> + use<> {
        let (x, y) = (idx % self.width, idx / self.width);
        let (w, h) = (self.width, self.height);
        [
            (x > 0).then(|| idx - 1),
            (x + 1 < w).then(|| idx + 1),
            (y > 0).then(|| idx - w),
            (y + 1 < h).then(|| idx + w),
        ]
        .into_iter()
        .flatten()
    }

    fn pixel(&self, idx: usize) -> &Rgb<u8> {
        self.image
            .get_pixel((idx % self.width) as u32, (idx / self.width) as u32)
    }

    fn push(&mut self, idx: usize, priority: u8) {
        self.labels[idx] = IN_QUEUE;
        self.heap.push(Reverse((priority, self.seq, idx)));
        self.seq += 1;
    }

    fn seed_queue(&mut self) {
        for idx in 0..self.labels.len() {
            if self.labels[idx] != 0 {
                continue;
            }
            let best = self
                .neighbours(idx)
                .filter(|&n| self.labels[n] > 0)
                .map(|n| colour_distance(self.pixel(idx), self.pixel(n)))
                .min();
            if let Some(priority) = best {
                self.push(idx, priority);
            }
        }
    }

    fn run(&mut self) {
        while let Some(Reverse((_, _, idx))) = self.heap.pop() {
            let mut label = 0;
            for n in self.neighbours(idx) {
                let l = self.labels[n];
                if l > 0 {
                    if label == 0 {
                        label = l;
                    } else if label != l {
                        label = WATERSHED_BOUNDARY;
                    }
                }
            }
            if label == 0 {
                // Only reachable when the queued neighbour was itself turned
                // into a boundary; treat the pixel as boundary too.
                label = WATERSHED_BOUNDARY;
            }
            self.labels[idx] = label;
            if label == WATERSHED_BOUNDARY {
                continue;
            }
            let next: Vec<usize> = self
                .neighbours(idx)
                .filter(|&n| self.labels[n] == 0)
                .collect();
            for n in next {
                let priority = colour_distance(self.pixel(n), self.pixel(idx));
                self.push(n, priority);
            }
        }
    }
}

/// Flood `markers` over `image`. Caller guarantees matching dimensions.
pub(crate) fn flood(image: &RgbImage, markers: &LabelImage) -> LabelImage {
    let (w, h) = markers.dimensions();
    let (width, height) = (w as usize, h as usize);
    let mut labels: Vec<i32> = markers
        .as_raw()
        .iter()
        .map(|&l| if l < 0 { WATERSHED_BOUNDARY } else { l })
        .collect();

    // Outer frame is always a boundary, so flooding never wraps or leaks.
    for x in 0..width {
        labels[x] = WATERSHED_BOUNDARY;
        labels[(height - 1) * width + x] = WATERSHED_BOUNDARY;
    }
    for y in 0..height {
        labels[y * width] = WATERSHED_BOUNDARY;
        labels[y * width + width - 1] = WATERSHED_BOUNDARY;
    }

    let mut flood = Flood {
        image,
        labels,
        width,
        height,
        heap: BinaryHeap::new(),
        seq: 0,
    };
    flood.seed_queue();
    flood.run();

    let mut out = LabelImage::new(w, h);
    for (dst, src) in out.iter_mut().zip(flood.labels) {
        *dst = src;
    }
    out
}

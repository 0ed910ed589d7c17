//! Froth analyzer: turns a frame into `FrothMetrics` and keeps the short
//! history the stability score and temporal variance are computed over.
//!
//! Stability is a weighted blend of three scores in [0, 1]:
//! - size uniformity `1 / (1 + std/mean)` over this frame's diameters
//! - count consistency `1 / (1 + std/mean)` over the count history
//! - density, a ramp up to `density_low`, flat to `density_high`, then a
//!   decay that bottoms out at `density_floor`
use std::collections::VecDeque;
use std::time::SystemTime;

use froth_traits::{Classification, Classifier, Segmentation};
use image::{GrayImage, RgbImage};
use tracing::{debug, trace};

use crate::config::{AnalyzerCfg, StabilityWeights};
use crate::detect::{BlobDetector, BlobSet, BlobSummary, Detection};
use crate::preprocess::{Preprocessed, Preprocessor};
use crate::util::{clamp_or_floor, mean, std_dev, variance};

#[derive(Debug, Clone, PartialEq)]
pub struct FrothMetrics {
    pub bubble_count: u32,
    /// Mean of squared diameters, pixels².
    pub avg_bubble_size: f64,
    pub avg_diameter: f64,
    pub size_std_dev: f64,
    pub min_diameter: f64,
    pub max_diameter: f64,
    pub avg_circularity: f64,
    /// Foreground fraction of the mask, [0, 1].
    pub coverage_ratio: f64,
    /// [0, 1].
    pub froth_stability: f64,
    /// Population variance of the count history.
    pub temporal_variance: f64,
    pub anomaly_detected: bool,
    /// Sequence number of the frame these metrics came from.
    pub seq: u64,
    pub timestamp: SystemTime,
}

impl FrothMetrics {
    pub fn empty(seq: u64) -> Self {
        Self {
            bubble_count: 0,
            avg_bubble_size: 0.0,
            avg_diameter: 0.0,
            size_std_dev: 0.0,
            min_diameter: 0.0,
            max_diameter: 0.0,
            avg_circularity: 0.0,
            coverage_ratio: 0.0,
            froth_stability: 0.0,
            temporal_variance: 0.0,
            anomaly_detected: false,
            seq,
            timestamp: SystemTime::now(),
        }
    }

    /// Classifier input: `[count, avg_bubble_size, size_std_dev, coverage]`.
    pub fn features(&self) -> [f64; 4] {
        [
            f64::from(self.bubble_count),
            self.avg_bubble_size,
            self.size_std_dev,
            self.coverage_ratio,
        ]
    }

    /// The value the controller regulates.
    pub fn measured_value(&self) -> f64 {
        f64::from(self.bubble_count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryEntry {
    pub count: f64,
    pub avg_diameter: f64,
    pub stability: f64,
}

/// Fixed-capacity push-and-evict buffer.
#[derive(Debug, Clone)]
pub struct History {
    capacity: usize,
    entries: VecDeque<HistoryEntry>,
}

impl History {
    /// Capacity 0 is treated as 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    fn push(&mut self, e: HistoryEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(e);
    }

    fn last_mut(&mut self) -> Option<&mut HistoryEntry> {
        self.entries.back_mut()
    }

    pub fn counts(&self) -> Vec<f64> {
        self.entries.iter().map(|e| e.count).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> + '_ {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Everything produced while analysing one frame.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub metrics: FrothMetrics,
    pub preprocessed: Option<Preprocessed>,
    pub detection: Detection,
}

pub struct FrothAnalyzer<S: Segmentation> {
    preprocessor: Preprocessor,
    detector: BlobDetector<S>,
    weights: StabilityWeights,
    history: History,
    classifier: Option<Box<dyn Classifier + Send + Sync>>,
}

impl<S: Segmentation> FrothAnalyzer<S> {
    pub fn new(preprocessor: Preprocessor, detector: BlobDetector<S>, cfg: AnalyzerCfg) -> Self {
        Self {
            preprocessor,
            detector,
            weights: cfg.weights,
            history: History::new(cfg.history),
            classifier: None,
        }
    }

    #[must_use]
    pub fn with_classifier(mut self, classifier: Box<dyn Classifier + Send + Sync>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Preprocess, detect and score one frame. An image the preprocessor
    /// rejects yields empty metrics and leaves the history untouched.
    pub fn analyze_frame(&mut self, image: &RgbImage, seq: u64) -> Analysis {
        let Some(pre) = self.preprocessor.process(image) else {
            return Analysis {
                metrics: FrothMetrics::empty(seq),
                preprocessed: None,
                detection: Detection::default(),
            };
        };
        let detection = self.detector.detect(&pre.closed, image);
        let metrics = self.metrics_from(&pre.closed, &detection.blobs, seq);
        Analysis {
            metrics,
            preprocessed: Some(pre),
            detection,
        }
    }

    /// Score a mask and its blobs, pushing one history entry.
    pub fn metrics_from(&mut self, mask: &GrayImage, blobs: &BlobSet, seq: u64) -> FrothMetrics {
        let summary = BlobSummary::of(blobs);
        let diameters = blobs.diameters();
        let count = u32::try_from(blobs.len()).unwrap_or(u32::MAX);
        let coverage = coverage_ratio(mask);

        // The current frame counts towards its own consistency score.
        self.history.push(HistoryEntry {
            count: f64::from(count),
            avg_diameter: summary.mean_diameter,
            stability: 0.0,
        });
        let stability = self.stability(summary.mean_diameter, summary.std_diameter, f64::from(count));
        if let Some(last) = self.history.last_mut() {
            last.stability = stability;
        }
        let temporal_variance = variance(&self.history.counts());

        let mut metrics = FrothMetrics {
            bubble_count: count,
            avg_bubble_size: mean(&diameters.iter().map(|d| d * d).collect::<Vec<_>>()),
            avg_diameter: summary.mean_diameter,
            size_std_dev: summary.std_diameter,
            min_diameter: summary.min_diameter,
            max_diameter: summary.max_diameter,
            avg_circularity: summary.mean_circularity,
            coverage_ratio: coverage,
            froth_stability: stability,
            temporal_variance,
            anomaly_detected: false,
            seq,
            timestamp: SystemTime::now(),
        };
        if let Some(model) = &self.classifier {
            metrics.anomaly_detected = model.classify(&metrics.features()) == Classification::Anomalous;
        }
        trace!(?metrics, "froth metrics");
        if metrics.anomaly_detected {
            debug!(seq, count, "froth anomaly flagged");
        }
        metrics
    }

    fn stability(&self, avg_diameter: f64, std_diameter: f64, count: f64) -> f64 {
        let w = &self.weights;
        let uniformity = if avg_diameter > 0.0 {
            1.0 / (1.0 + std_diameter / avg_diameter)
        } else {
            0.0
        };
        let consistency = if self.history.len() >= 3 {
            let counts = self.history.counts();
            let m = mean(&counts);
            if m > 0.0 {
                1.0 / (1.0 + std_dev(&counts) / m)
            } else {
                0.0
            }
        } else {
            w.neutral_consistency
        };
        let density = density_score(count, w);
        let blended = w.uniformity * uniformity + w.consistency * consistency + w.density * density;
        clamp_or_floor(blended, 0.0, 1.0)
    }

    /// Forget the history; the next frames start from the neutral consistency.
    pub fn reset_history(&mut self) {
        self.history.clear();
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn detector(&self) -> &BlobDetector<S> {
        &self.detector
    }

    pub fn preprocessor(&self) -> &Preprocessor {
        &self.preprocessor
    }
}

/// Non-zero pixels over total pixels; 0 for an empty mask.
pub fn coverage_ratio(mask: &GrayImage) -> f64 {
    let total = u64::from(mask.width()) * u64::from(mask.height());
    if total == 0 {
        return 0.0;
    }
    let fg = mask.pixels().filter(|p| p[0] != 0).count() as f64;
    fg / total as f64
}

fn density_score(count: f64, w: &StabilityWeights) -> f64 {
    if count < w.density_low {
        if w.density_low > 0.0 { count / w.density_low } else { 1.0 }
    } else if count > w.density_high {
        let span = if w.density_high > 0.0 { w.density_high } else { 1.0 };
        1.0 - ((count - w.density_high) / span).min(1.0 - w.density_floor)
    } else {
        1.0
    }
}

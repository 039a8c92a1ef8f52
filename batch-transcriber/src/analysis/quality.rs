//! Confidence-based quality metrics for merged transcripts

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{mean, sample_std_dev};
use crate::protocol::Segment;

/// How segments are split when comparing early and late confidence
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum SplitStrategy {
    /// First half against second half
    Midpoint,
    /// Leading window against trailing window, each `fraction` of the segments
    Window { fraction: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Early minus late mean confidence above which quality is considered degraded
    pub degradation_threshold: f64,
    pub split: SplitStrategy,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            degradation_threshold: 0.3,
            split: SplitStrategy::Midpoint,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    Excellent,
    Good,
    Acceptable,
    Poor,
    Unknown,
}

impl QualityTier {
    /// Tier for a mean confidence; degradation rules out `Excellent`
    pub fn classify(mean_confidence: f64, degraded: bool) -> Self {
        if mean_confidence > -0.3 && !degraded {
            Self::Excellent
        } else if mean_confidence > -0.8 {
            Self::Good
        } else if mean_confidence > -1.2 {
            Self::Acceptable
        } else {
            Self::Poor
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Acceptable => "acceptable",
            Self::Poor => "poor",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Percentiles {
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub confidence_simple_avg: f64,
    /// Confidence weighted by segment duration
    pub confidence_weighted_avg: f64,
    pub percentiles: Percentiles,
    pub degradation_detected: bool,
    pub early_vs_late_diff: f64,
    pub segment_count: usize,
    pub avg_segment_duration: f64,
    pub quality_tier: QualityTier,
    pub confidence_std: f64,
}

impl QualityReport {
    /// Report for input with nothing to measure
    pub fn unknown() -> Self {
        Self {
            confidence_simple_avg: 0.0,
            confidence_weighted_avg: 0.0,
            percentiles: Percentiles::default(),
            degradation_detected: false,
            early_vs_late_diff: 0.0,
            segment_count: 0,
            avg_segment_duration: 0.0,
            quality_tier: QualityTier::Unknown,
            confidence_std: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QualityMetricsCalculator {
    config: QualityConfig,
}

impl QualityMetricsCalculator {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    pub fn calculate(&self, segments: &[Segment]) -> QualityReport {
        let scored: Vec<(f64, f64)> = segments
            .iter()
            .filter_map(|s| s.known_confidence().map(|c| (c, s.duration())))
            .collect();

        if scored.is_empty() {
            return QualityReport::unknown();
        }

        let confidences: Vec<f64> = scored.iter().map(|(c, _)| *c).collect();
        let simple_avg = mean(&confidences).unwrap_or(0.0);

        let total_duration: f64 = scored.iter().map(|(_, d)| d).sum();
        let weighted_avg = if total_duration > 0.0 {
            scored.iter().map(|(c, d)| c * d).sum::<f64>() / total_duration
        } else {
            simple_avg
        };

        let early_vs_late_diff = self.early_vs_late(&confidences);
        let degradation_detected = early_vs_late_diff > self.config.degradation_threshold;

        let durations: Vec<f64> = segments.iter().map(Segment::duration).collect();

        QualityReport {
            confidence_simple_avg: simple_avg,
            confidence_weighted_avg: weighted_avg,
            percentiles: percentiles(&confidences),
            degradation_detected,
            early_vs_late_diff,
            segment_count: segments.len(),
            avg_segment_duration: mean(&durations).unwrap_or(0.0),
            quality_tier: QualityTier::classify(simple_avg, degradation_detected),
            confidence_std: sample_std_dev(&confidences).unwrap_or(0.0),
        }
    }

    /// Early mean minus late mean, 0 when either side is empty
    fn early_vs_late(&self, confidences: &[f64]) -> f64 {
        let n = confidences.len();
        let (early, late) = match self.config.split {
            SplitStrategy::Midpoint => confidences.split_at(n / 2),
            SplitStrategy::Window { fraction } => {
                let window = ((n as f64 * fraction.clamp(0.0, 0.5)) as usize).max(1);
                if window * 2 > n {
                    return 0.0;
                }
                (&confidences[..window], &confidences[n - window..])
            }
        };

        match (mean(early), mean(late)) {
            (Some(e), Some(l)) => e - l,
            _ => 0.0,
        }
    }
}

fn percentiles(values: &[f64]) -> Percentiles {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let at = |q: f64| -> f64 {
        if sorted.is_empty() {
            return 0.0;
        }
        let index = ((sorted.len() as f64 * q) as usize).min(sorted.len() - 1);
        sorted[index]
    };

    Percentiles {
        p25: at(0.25),
        p50: at(0.50),
        p75: at(0.75),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::UNKNOWN_CONFIDENCE;

    fn seg(start: f64, end: f64, confidence: f64) -> Segment {
        Segment::new(start, end, "text", confidence)
    }

    #[test]
    fn test_empty_input_is_unknown() {
        let calc = QualityMetricsCalculator::default();

        assert_eq!(calc.calculate(&[]), QualityReport::unknown());

        let unscored = calc.calculate(&[seg(0.0, 1.0, UNKNOWN_CONFIDENCE)]);
        assert_eq!(unscored.quality_tier, QualityTier::Unknown);
        assert_eq!(unscored.segment_count, 0);
    }

    #[test]
    fn test_classify_boundaries() {
        assert_eq!(QualityTier::classify(-0.1, false), QualityTier::Excellent);
        assert_eq!(QualityTier::classify(-0.1, true), QualityTier::Good);
        assert_eq!(QualityTier::classify(-0.3, false), QualityTier::Good);
        assert_eq!(QualityTier::classify(-0.8, false), QualityTier::Acceptable);
        assert_eq!(QualityTier::classify(-1.2, false), QualityTier::Poor);
        assert_eq!(QualityTier::classify(-4.0, true), QualityTier::Poor);
    }

    #[test]
    fn test_weighted_average_uses_durations() {
        let report = QualityMetricsCalculator::default()
            .calculate(&[seg(0.0, 3.0, -0.1), seg(3.0, 4.0, -0.9)]);

        assert!((report.confidence_simple_avg + 0.5).abs() < 1e-9);
        assert!((report.confidence_weighted_avg + 0.3).abs() < 1e-9);
        assert_eq!(report.segment_count, 2);
        assert!((report.avg_segment_duration - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_duration_falls_back_to_simple_mean() {
        let report = QualityMetricsCalculator::default()
            .calculate(&[seg(1.0, 1.0, -0.2), seg(2.0, 2.0, -0.4)]);

        assert!((report.confidence_weighted_avg + 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_percentiles_clamp_index() {
        let p = percentiles(&[-0.4, -0.1, -0.3, -0.2]);
        assert_eq!((p.p25, p.p50, p.p75), (-0.3, -0.2, -0.1));

        let single = percentiles(&[-0.5]);
        assert_eq!((single.p25, single.p50, single.p75), (-0.5, -0.5, -0.5));
    }

    #[test]
    fn test_degradation_midpoint() {
        let segments = vec![
            seg(0.0, 1.0, -0.1),
            seg(1.0, 2.0, -0.1),
            seg(2.0, 3.0, -0.6),
            seg(3.0, 4.0, -0.6),
        ];

        let report = QualityMetricsCalculator::default().calculate(&segments);

        assert!(report.degradation_detected);
        assert!((report.early_vs_late_diff - 0.5).abs() < 1e-9);
        // mean -0.35 is not excellent either way, but degradation caps it at good
        assert_eq!(report.quality_tier, QualityTier::Good);
    }

    #[test]
    fn test_degradation_window_ignores_the_middle() {
        let segments: Vec<Segment> = [-0.1, -0.9, -0.9, -0.9, -0.9, -0.9, -0.9, -0.9, -0.9, -0.1]
            .iter()
            .enumerate()
            .map(|(i, c)| seg(i as f64, i as f64 + 1.0, *c))
            .collect();

        let midpoint = QualityMetricsCalculator::default().calculate(&segments);
        let window = QualityMetricsCalculator::new(QualityConfig {
            split: SplitStrategy::Window { fraction: 0.1 },
            ..QualityConfig::default()
        })
        .calculate(&segments);

        assert!(!midpoint.degradation_detected);
        assert_eq!(window.early_vs_late_diff, 0.0);
    }

    #[test]
    fn test_single_scored_segment_never_degrades() {
        let report = QualityMetricsCalculator::default().calculate(&[seg(0.0, 1.0, -0.2)]);

        assert!(!report.degradation_detected);
        assert_eq!(report.quality_tier, QualityTier::Excellent);
        assert_eq!(report.confidence_std, 0.0);
    }
}

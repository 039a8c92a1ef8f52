//! Segment statistics and the adaptive merge threshold.
//!
//! The analyzer looks at every adjacent pair of raw segments and derives how
//! long the pauses between them usually are and how fast the speaker talks.
//! Fast speakers leave longer pauses inside a sentence, so the threshold
//! below which two segments are considered one utterance grows with the
//! speech rate and with the irregularity of the gaps.

pub mod merge;
pub mod quality;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::protocol::Segment;

pub use merge::{MergeConfig, MergeDecision, SegmentMerger};
pub use quality::{QualityConfig, QualityMetricsCalculator, QualityReport, QualityTier};

/// Shortest duration used when computing words per second
pub const MIN_SEGMENT_DURATION: f64 = 0.001;

/// Gap standard deviation above which the threshold is widened
pub const IRREGULAR_GAP_STD_DEV: f64 = 0.2;

const FAST_SPEECH_RATE: f64 = 2.0;
const SLOW_SPEECH_RATE: f64 = 1.0;

/// How much data the analysis was based on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisQuality {
    Low,
    Medium,
    High,
    /// Fewer than two segments, defaults were used
    Unavailable,
}

impl AnalysisQuality {
    fn from_pair_count(pairs: usize) -> Self {
        if pairs > 20 {
            Self::High
        } else if pairs > 10 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

/// Statistics over one file's raw segments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentAnalysis {
    /// Mean gap between consecutive segments in seconds
    pub avg_gap: f64,
    /// Sample standard deviation of the gaps
    pub std_dev_gap: f64,
    /// Mean segment duration in seconds
    pub avg_duration: f64,
    /// Mean words per second
    pub speech_rate: f64,
    /// Largest gap still eligible for merging, always > 0
    pub adaptive_threshold: f64,
    /// Mean of known confidences
    pub confidence_mean: f64,
    /// Sample standard deviation of known confidences
    pub confidence_std: f64,
    /// Number of segments analysed
    pub total_segments: usize,
    pub analysis_quality: AnalysisQuality,
}

impl SegmentAnalysis {
    /// Analysis used when there is not enough data to measure anything
    pub fn fallback(total_segments: usize) -> Self {
        Self {
            avg_gap: 0.3,
            std_dev_gap: 0.15,
            avg_duration: 3.0,
            speech_rate: 1.5,
            adaptive_threshold: 0.5,
            confidence_mean: 0.0,
            confidence_std: 0.0,
            total_segments,
            analysis_quality: AnalysisQuality::Unavailable,
        }
    }
}

/// Base merge threshold for a speech rate, before variability scaling.
///
/// Monotonically non-decreasing in `speech_rate`.
pub fn base_threshold(speech_rate: f64) -> f64 {
    if speech_rate > FAST_SPEECH_RATE {
        0.7
    } else if speech_rate < SLOW_SPEECH_RATE {
        0.3
    } else {
        0.5
    }
}

/// Computes `SegmentAnalysis` for a segment sequence
#[derive(Debug, Clone, Default)]
pub struct SegmentAnalyzer;

impl SegmentAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Analyze an ordered segment sequence
    pub fn analyze(&self, segments: &[Segment]) -> SegmentAnalysis {
        if segments.len() < 2 {
            return SegmentAnalysis::fallback(segments.len());
        }

        let pairs = segments.len() - 1;
        let mut gaps = Vec::with_capacity(pairs);
        let mut durations = Vec::with_capacity(pairs);
        let mut rates = Vec::with_capacity(pairs);
        let mut confidences = Vec::with_capacity(pairs);

        for window in segments.windows(2) {
            let (current, next) = (&window[0], &window[1]);
            let duration = (current.end - current.start).max(MIN_SEGMENT_DURATION);

            gaps.push(next.start - current.end);
            durations.push(duration);
            rates.push(current.word_count() as f64 / duration);
            if let Some(confidence) = current.known_confidence() {
                confidences.push(confidence);
            }
        }

        let avg_gap = mean(&gaps).unwrap_or(0.3);
        let std_dev_gap = sample_std_dev(&gaps).unwrap_or(0.0);
        let avg_duration = mean(&durations).unwrap_or(3.0);
        let speech_rate = mean(&rates).unwrap_or(1.5);

        let mut adaptive_threshold = base_threshold(speech_rate);
        if std_dev_gap > IRREGULAR_GAP_STD_DEV && avg_gap > 0.0 {
            adaptive_threshold *= 1.0 + std_dev_gap / avg_gap;
        }

        let analysis = SegmentAnalysis {
            avg_gap,
            std_dev_gap,
            avg_duration,
            speech_rate,
            adaptive_threshold,
            confidence_mean: mean(&confidences).unwrap_or(0.0),
            confidence_std: sample_std_dev(&confidences).unwrap_or(0.0),
            total_segments: segments.len(),
            analysis_quality: AnalysisQuality::from_pair_count(pairs),
        };

        debug!(
            segments = segments.len(),
            speech_rate = analysis.speech_rate,
            threshold = analysis.adaptive_threshold,
            "Analyzed segments"
        );

        analysis
    }
}

/// Arithmetic mean, `None` for an empty slice
pub(crate) fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Sample (n - 1) standard deviation, `None` for fewer than two values
pub(crate) fn sample_std_dev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let avg = mean(values)?;
    let variance =
        values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(variance.sqrt())
}

//! Merge raw recognizer segments into coherent utterances.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, trace};

use super::SegmentAnalysis;
use crate::protocol::{Segment, UNKNOWN_CONFIDENCE};

/// Merge tuning
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Mean confidence below which two known-confidence segments are kept apart
    pub low_confidence_cutoff: f64,
    /// Gaps shorter than this are always merged
    pub micro_gap: f64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            low_confidence_cutoff: -1.5,
            micro_gap: 0.1,
        }
    }
}

/// Why two adjacent segments were or were not merged
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MergeDecision {
    Overlapping { gap: f64 },
    MicroGap { gap: f64 },
    GapTooLarge { gap: f64, threshold: f64 },
    LowConfidence { mean: f64 },
    GapAcceptable { gap: f64, threshold: f64 },
}

impl MergeDecision {
    pub fn should_merge(&self) -> bool {
        !matches!(self, Self::GapTooLarge { .. } | Self::LowConfidence { .. })
    }
}

impl fmt::Display for MergeDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overlapping { gap } => write!(f, "overlapping_segments: gap={:.3}s", gap),
            Self::MicroGap { gap } => write!(f, "micro_gap: {:.3}s", gap),
            Self::GapTooLarge { gap, threshold } => {
                write!(f, "gap_too_large: {:.3}s > {:.3}s", gap, threshold)
            }
            Self::LowConfidence { mean } => write!(f, "confidence_too_low: {:.2}", mean),
            Self::GapAcceptable { gap, threshold } => {
                write!(f, "gap_acceptable: {:.3}s <= {:.3}s", gap, threshold)
            }
        }
    }
}

/// Adaptive segment merger
#[derive(Debug, Clone, Default)]
pub struct SegmentMerger {
    config: MergeConfig,
}

impl SegmentMerger {
    pub fn new(config: MergeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// Decide whether `next` should be folded into `current`
    pub fn decide(&self, current: &Segment, next: &Segment, analysis: &SegmentAnalysis) -> MergeDecision {
        let gap = next.start - current.end;
        let threshold = analysis.adaptive_threshold;

        if gap < 0.0 {
            return MergeDecision::Overlapping { gap };
        }
        if gap < self.config.micro_gap {
            return MergeDecision::MicroGap { gap };
        }
        if gap > threshold {
            return MergeDecision::GapTooLarge { gap, threshold };
        }
        if let (Some(a), Some(b)) = (current.known_confidence(), next.known_confidence()) {
            let mean = (a + b) / 2.0;
            if mean < self.config.low_confidence_cutoff {
                return MergeDecision::LowConfidence { mean };
            }
        }
        MergeDecision::GapAcceptable { gap, threshold }
    }

    /// One left-to-right pass with a running accumulator
    pub fn merge_pass(&self, segments: &[Segment], analysis: &SegmentAnalysis) -> Vec<Segment> {
        let mut merged = Vec::with_capacity(segments.len());
        let mut iter = segments.iter();
        let Some(first) = iter.next() else {
            return merged;
        };

        let mut current = first.clone();
        for next in iter {
            let decision = self.decide(&current, next, analysis);
            trace!("{:.2}-{:.2} / {:.2}-{:.2}: {}", current.start, current.end, next.start, next.end, decision);

            if decision.should_merge() {
                current = combine(&current, next);
            } else {
                merged.push(std::mem::replace(&mut current, next.clone()));
            }
        }
        merged.push(current);

        merged
    }

    /// Merge until a pass makes no further change.
    ///
    /// The result is a fixed point of `merge_pass`, so merging it again is a no-op.
    pub fn merge(&self, segments: &[Segment], analysis: &SegmentAnalysis) -> Vec<Segment> {
        let mut merged = self.merge_pass(segments, analysis);
        let mut passes = 1;

        loop {
            let again = self.merge_pass(&merged, analysis);
            if again.len() == merged.len() {
                break;
            }
            merged = again;
            passes += 1;
        }

        debug!(
            raw = segments.len(),
            merged = merged.len(),
            passes,
            "Merged segments"
        );
        merged
    }
}

/// Fold `next` into `current`: span both, join text, duration-weighted confidence
fn combine(current: &Segment, next: &Segment) -> Segment {
    let text = [current.text.trim(), next.text.trim()]
        .into_iter()
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    Segment {
        start: current.start.min(next.start),
        end: current.end.max(next.end),
        text,
        confidence: weighted_confidence(current, next),
    }
}

fn weighted_confidence(a: &Segment, b: &Segment) -> f64 {
    match (a.known_confidence(), b.known_confidence()) {
        (Some(ca), Some(cb)) => {
            let (da, db) = (a.duration(), b.duration());
            if da + db > 0.0 {
                (ca * da + cb * db) / (da + db)
            } else {
                (ca + cb) / 2.0
            }
        }
        (Some(c), None) | (None, Some(c)) => c,
        (None, None) => UNKNOWN_CONFIDENCE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::SegmentAnalyzer;

    fn seg(start: f64, end: f64, text: &str, confidence: f64) -> Segment {
        Segment::new(start, end, text, confidence)
    }

    fn analysis_with_threshold(threshold: f64) -> SegmentAnalysis {
        SegmentAnalysis {
            adaptive_threshold: threshold,
            ..SegmentAnalysis::fallback(0)
        }
    }

    #[test]
    fn test_micro_gap_merges_into_single_segment() {
        let segments = vec![seg(0.0, 1.0, "a b c d", -0.2), seg(1.05, 2.0, "e f", -0.3)];
        let analysis = SegmentAnalyzer::new().analyze(&segments);

        let merged = SegmentMerger::default().merge(&segments, &analysis);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].start, 0.0);
        assert_eq!(merged[0].end, 2.0);
        assert_eq!(merged[0].text, "a b c d e f");
        let expected = (-0.2 * 1.0 + -0.3 * 0.95) / 1.95;
        assert!((merged[0].confidence - expected).abs() < 1e-9);
    }

    #[test]
    fn test_decision_priority() {
        let merger = SegmentMerger::default();
        let analysis = analysis_with_threshold(0.5);
        let a = seg(0.0, 1.0, "a", -2.0);

        // overlap wins even with terrible confidence
        let overlap = merger.decide(&a, &seg(0.9, 2.0, "b", -2.0), &analysis);
        assert!(matches!(overlap, MergeDecision::Overlapping { .. }));
        assert!(overlap.should_merge());

        let micro = merger.decide(&a, &seg(1.05, 2.0, "b", -2.0), &analysis);
        assert!(matches!(micro, MergeDecision::MicroGap { .. }));

        let large = merger.decide(&a, &seg(1.6, 2.0, "b", -0.1), &analysis);
        assert!(matches!(large, MergeDecision::GapTooLarge { .. }));
        assert!(!large.should_merge());

        let low = merger.decide(&a, &seg(1.3, 2.0, "b", -1.5), &analysis);
        assert!(matches!(low, MergeDecision::LowConfidence { .. }));
        assert!(!low.should_merge());

        let fine = merger.decide(&seg(0.0, 1.0, "a", -0.5), &seg(1.3, 2.0, "b", -0.5), &analysis);
        assert!(matches!(fine, MergeDecision::GapAcceptable { .. }));
    }

    #[test]
    fn test_unknown_confidence_never_vetoes() {
        let merger = SegmentMerger::default();
        let analysis = analysis_with_threshold(0.5);

        let decision = merger.decide(
            &seg(0.0, 1.0, "a", UNKNOWN_CONFIDENCE),
            &seg(1.3, 2.0, "b", -3.0),
            &analysis,
        );
        assert!(decision.should_merge());
    }

    #[test]
    fn test_cutoff_is_configurable() {
        let strict = SegmentMerger::new(MergeConfig {
            low_confidence_cutoff: -0.4,
            ..MergeConfig::default()
        });
        let analysis = analysis_with_threshold(0.5);

        let decision = strict.decide(&seg(0.0, 1.0, "a", -0.5), &seg(1.3, 2.0, "b", -0.5), &analysis);
        assert!(matches!(decision, MergeDecision::LowConfidence { .. }));
    }

    #[test]
    fn test_weighted_confidence_favours_longer_segment() {
        let long = seg(0.0, 3.0, "long", -0.1);
        let short = seg(3.0, 4.0, "short", -0.9);

        let combined = combine(&long, &short);

        assert!((combined.confidence - (-0.3)).abs() < 1e-9);
        assert_eq!(combine(&long, &seg(3.0, 4.0, "x", UNKNOWN_CONFIDENCE)).confidence, -0.1);
        assert_eq!(
            combine(&seg(0.0, 1.0, "", UNKNOWN_CONFIDENCE), &seg(1.0, 2.0, "y", UNKNOWN_CONFIDENCE)).confidence,
            UNKNOWN_CONFIDENCE
        );
    }

    #[test]
    fn test_contained_segment_does_not_shrink_span() {
        let merged = combine(&seg(0.0, 5.0, "outer", -0.2), &seg(1.0, 2.0, "inner", -0.2));
        assert_eq!((merged.start, merged.end), (0.0, 5.0));
    }

    #[test]
    fn test_output_never_longer_than_input() {
        let segments = vec![
            seg(0.0, 1.0, "one", -0.2),
            seg(3.0, 4.0, "two", -0.2),
            seg(8.0, 9.0, "three", -0.2),
        ];
        let analysis = analysis_with_threshold(0.5);

        let merged = SegmentMerger::default().merge(&segments, &analysis);

        assert_eq!(merged, segments);
        assert!(SegmentMerger::default().merge(&[], &analysis).is_empty());
    }

    #[test]
    fn test_merge_is_idempotent() {
        // third segment is vetoed on its own, but its merged group is not
        let segments = vec![
            seg(0.0, 1.0, "a", -1.2),
            seg(1.3, 2.0, "b", -1.2),
            seg(2.3, 2.5, "c", -2.5),
            seg(2.55, 6.0, "d", -0.1),
            seg(6.4, 7.0, "e", -0.4),
            seg(9.0, 10.0, "f", -0.3),
            seg(9.5, 10.5, "g", UNKNOWN_CONFIDENCE),
        ];
        let analysis = analysis_with_threshold(0.5);
        let merger = SegmentMerger::default();

        let once = merger.merge(&segments, &analysis);
        let twice = merger.merge(&once, &analysis);

        assert_eq!(once, twice);
        assert!(once.len() < segments.len());
    }

    /// xorshift64, so generated sequences are the same on every run
    struct Xorshift(u64);

    impl Xorshift {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }

        /// Uniform in `[low, high)`
        fn range(&mut self, low: f64, high: f64) -> f64 {
            low + (self.next() >> 11) as f64 / (1u64 << 53) as f64 * (high - low)
        }
    }

    fn generated(rng: &mut Xorshift) -> Vec<Segment> {
        let count = (rng.next() % 14) as usize;
        let mut cursor = 0.0;
        (0..count)
            .map(|i| {
                let start = (cursor + rng.range(-0.4, 1.2)).max(0.0);
                let end = start + rng.range(0.0, 2.5);
                cursor = end;
                let confidence = if rng.next() % 5 == 0 {
                    UNKNOWN_CONFIDENCE
                } else {
                    rng.range(-3.0, 0.0)
                };
                seg(start, end, &format!("w{} x", i), confidence)
            })
            .collect()
    }

    #[test]
    fn test_merge_is_idempotent_over_generated_sequences() {
        let mut rng = Xorshift(0x9E37_79B9_7F4A_7C15);
        let analyzer = SegmentAnalyzer::new();
        let merger = SegmentMerger::default();

        for _ in 0..5000 {
            let segments = generated(&mut rng);
            let analysis = if rng.next() % 2 == 0 {
                analyzer.analyze(&segments)
            } else {
                analysis_with_threshold(rng.range(0.1, 1.5))
            };

            let once = merger.merge(&segments, &analysis);
            let twice = merger.merge(&once, &analysis);

            assert!(once.len() <= segments.len());
            assert_eq!(once, twice, "not a fixed point for {:?}", segments);
        }
    }
}

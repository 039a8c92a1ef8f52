use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::analysis::quality::QualityReport;
use crate::analysis::SegmentAnalysis;
use crate::{BatchError, Result};

/// Confidence value recognizers report when they have no score for a segment
pub const UNKNOWN_CONFIDENCE: f64 = -1.0;

/// A timestamped span of recognized speech
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Start time in seconds
    pub start: f64,
    /// End time in seconds (never before `start`)
    pub end: f64,
    /// Recognized text
    pub text: String,
    /// Log-probability-like score, <= 0, closer to 0 is better
    #[serde(default = "unknown_confidence")]
    pub confidence: f64,
}

fn unknown_confidence() -> f64 {
    UNKNOWN_CONFIDENCE
}

impl Segment {
    /// Create a new segment; `end` is clamped so it never precedes `start`
    pub fn new(start: f64, end: f64, text: impl Into<String>, confidence: f64) -> Self {
        Self {
            start,
            end: end.max(start),
            text: text.into(),
            confidence,
        }
    }

    /// Segment length in seconds
    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    /// Confidence, or `None` when the recognizer reported the unknown sentinel
    pub fn known_confidence(&self) -> Option<f64> {
        if self.confidence == UNKNOWN_CONFIDENCE || !self.confidence.is_finite() {
            None
        } else {
            Some(self.confidence)
        }
    }

    /// Number of whitespace-separated words in the text
    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

/// Decoded audio handed from the decoder to the recognizer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodedAudio {
    /// Unique identifier for this decode
    pub id: Uuid,
    /// File the samples were decoded from
    pub source: PathBuf,
    /// Raw audio data as f32 samples
    pub audio: Vec<f32>,
    /// Sample rate (e.g., 16000)
    pub sample_rate: u32,
    /// Number of interleaved channels
    pub channels: u16,
    /// Timestamp when the audio was decoded
    pub timestamp: DateTime<Utc>,
}

impl DecodedAudio {
    /// Create decoded audio for the given source file
    pub fn new(source: impl Into<PathBuf>, audio: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            audio,
            sample_rate,
            channels,
            timestamp: Utc::now(),
        }
    }

    /// Get the duration of the audio in seconds
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0.0;
        }
        (self.audio.len() / self.channels as usize) as f64 / self.sample_rate as f64
    }
}

/// Result of running one file through decode, recognition and post-processing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTranscript {
    /// File the transcript was produced from
    pub source: PathBuf,
    /// Number of segments the recognizer returned before merging
    pub raw_segment_count: usize,
    /// Merged segments
    pub segments: Vec<Segment>,
    /// Statistics over the raw segments
    pub analysis: SegmentAnalysis,
    /// Quality metrics over the merged segments
    pub quality: QualityReport,
    /// Where the rendered transcript was written, if a writer is configured
    pub output_path: Option<PathBuf>,
    /// Audio duration in seconds
    pub audio_duration: f64,
    /// Wall-clock time spent on this file in milliseconds
    pub processing_time_ms: u64,
}

impl FileTranscript {
    /// Full transcript text, segments joined by single spaces
    pub fn text(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Reply a recognizer subprocess writes for one request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionReply {
    /// Identifier matching the original `DecodedAudio`
    pub id: Uuid,
    /// Ordered segments, empty on error
    #[serde(default)]
    pub segments: Vec<Segment>,
    /// Error reported by the backend
    #[serde(default)]
    pub error: Option<ReplyError>,
}

/// Error payload inside a `RecognitionReply`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyError {
    /// Error message
    pub message: String,
    /// Error code for programmatic handling
    pub code: String,
    /// Whether the backend considers the failure worth retrying
    pub retryable: bool,
}

impl RecognitionReply {
    /// Successful reply
    pub fn ok(id: Uuid, segments: Vec<Segment>) -> Self {
        Self {
            id,
            segments,
            error: None,
        }
    }

    /// Failed reply
    pub fn failed(id: Uuid, message: impl Into<String>, code: impl Into<String>, retryable: bool) -> Self {
        Self {
            id,
            segments: Vec::new(),
            error: Some(ReplyError {
                message: message.into(),
                code: code.into(),
                retryable,
            }),
        }
    }
}

/// Encode a value as one line-protocol frame: hex of named-field MessagePack
pub fn encode_frame<T: Serialize>(value: &T) -> Result<String> {
    Ok(hex::encode(rmp_serde::to_vec_named(value)?))
}

/// Decode a frame produced by `encode_frame`
pub fn decode_frame<T: DeserializeOwned>(frame: &str) -> Result<T> {
    let bytes = hex::decode(frame.trim())
        .map_err(|e| BatchError::Worker(format!("invalid hex frame: {}", e)))?;
    Ok(rmp_serde::from_slice(&bytes)?)
}

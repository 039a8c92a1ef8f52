//! Batch Transcriber - resumable batch transcription of audio files
//!
//! This crate drives large sets of audio files through an external speech
//! recognition backend. It features:
//!
//! - A bounded worker pool with shared or isolated execution
//! - Crash-safe JSON batch state so a killed run resumes where it stopped
//! - Adaptive merging of raw recognizer segments into coherent utterances
//! - Confidence-based quality metrics with degradation detection
//! - Milestone progress events with ETA
//! - Memory health checks that pause admission of new work
//!
//! # Example
//!
//! ```rust,ignore
//! use batch_transcriber::{
//!     scheduler::{BatchScheduler, SchedulerConfig},
//!     state::{BatchStateStore, StoreConfig},
//!     monitor::MemoryMonitor,
//!     tracker::NullSink,
//!     worker::{CommandRecognizer, Pipeline},
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = BatchStateStore::open(".batch_state", "nightly", StoreConfig::default())?;
//!     let recognizer = CommandRecognizer::new("python3", ["recognize.py"]);
//!     let pipeline = Pipeline::new(Arc::new(MyDecoder), Arc::new(recognizer));
//!
//!     let mut scheduler = BatchScheduler::new(SchedulerConfig::default(), pipeline, store, MemoryMonitor::new());
//!     let summary = scheduler.run(vec!["a.wav".into(), "b.wav".into()], NullSink).await;
//!     println!("{} of {} done", summary.statistics.completed, summary.statistics.total);
//!     Ok(())
//! }
//! ```

pub mod analysis;
pub mod monitor;
pub mod protocol;
pub mod scheduler;
pub mod state;
pub mod tracker;
pub mod worker;

// Re-export commonly used types for convenience
pub use analysis::{SegmentAnalysis, SegmentAnalyzer, SegmentMerger, QualityMetricsCalculator, QualityReport, QualityTier};
pub use monitor::{MemoryConfig, MemoryMonitor, MemoryProbe};
pub use protocol::{DecodedAudio, FileTranscript, Segment, UNKNOWN_CONFIDENCE};
pub use scheduler::{AbortHandle, BatchScheduler, BatchSummary, SchedulerConfig};
pub use state::{BatchStateStore, FileRecord, FileStatus, StoreConfig};
pub use tracker::{ProgressEvent, ProgressSink, ProgressTracker, Severity};
pub use worker::{AudioDecoder, DecodeError, ExecutionMode, Pipeline, RecognitionError, Recognizer};

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while processing a batch
#[derive(Error, Debug)]
pub enum BatchError {
    /// Recognition failed but may succeed on retry
    #[error("Transient recognition error: {0}")]
    TransientRecognition(String),

    /// The file can never be processed
    #[error("Fatal error for {path}: {message}")]
    FatalFile { path: PathBuf, message: String },

    /// Batch state could not be written
    #[error("Failed to persist batch state to {path}: {source}")]
    StatePersistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Memory health check failed
    #[error("Memory pressure: {0}")]
    MemoryPressure(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Worker management error
    #[error("Worker error: {0}")]
    Worker(String),
}

/// Result type alias for batch-transcriber operations
pub type Result<T> = std::result::Result<T, BatchError>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Default directory for batch state files
pub const DEFAULT_STATE_DIR: &str = ".batch_state";

/// Utility functions for common operations
pub mod utils {
    use crate::protocol::DecodedAudio;
    use std::path::{Component, Path, PathBuf};

    /// Create a sine tone with the specified duration in seconds
    pub fn test_tone(source: impl AsRef<Path>, duration_seconds: f64, sample_rate: u32) -> DecodedAudio {
        let samples = (duration_seconds * sample_rate as f64) as usize;
        let audio: Vec<f32> = (0..samples)
            .map(|i| (i as f32 / sample_rate as f32 * 440.0 * 2.0 * std::f32::consts::PI).sin() * 0.1)
            .collect();

        DecodedAudio::new(source.as_ref(), audio, sample_rate, 1)
    }

    /// Validate decoded audio parameters
    pub fn validate_audio(audio: &DecodedAudio) -> bool {
        audio.sample_rate > 0
            && audio.channels > 0
            && !audio.audio.is_empty()
            && audio.audio.len() % audio.channels as usize == 0
    }

    /// Key under which a file is tracked in batch state
    ///
    /// The path is made absolute and normalised lexically (`.` dropped, `..`
    /// folded) without touching the filesystem, so the key of a file never
    /// changes when it is created, removed or replaced by a symlink.
    pub fn path_key(path: &Path) -> String {
        let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());

        let mut normalized = PathBuf::new();
        for component in absolute.components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => match normalized.components().next_back() {
                    Some(Component::Normal(_)) => {
                        normalized.pop();
                    }
                    Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                    _ => normalized.push(".."),
                },
                other => normalized.push(other),
            }
        }

        normalized.to_string_lossy().into_owned()
    }
}

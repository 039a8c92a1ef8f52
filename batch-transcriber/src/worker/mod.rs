//! Per-file pipeline and the runners that execute it.
//!
//! A job is one audio file. It is decoded, recognized, analysed, merged,
//! scored and optionally written out; the result travels back to the
//! coordinator as exactly one `TaskReport`. Two runners share the
//! `TaskRunner` trait: `SharedRunner` runs jobs on the tokio blocking pool
//! against one shared pipeline, `IsolatedRunner` gives every job its own
//! named OS thread and an owned pipeline, with the job and the report
//! crossing the thread boundary as MessagePack frames.

pub mod command;

use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::analysis::{MergeConfig, QualityConfig, QualityMetricsCalculator, SegmentAnalyzer, SegmentMerger};
use crate::protocol::{decode_frame, encode_frame, DecodedAudio, FileTranscript, Segment};
use crate::utils::validate_audio;
use crate::BatchError;

pub use command::{CommandConfig, CommandRecognizer};

/// Error from a speech recognition backend
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecognitionError {
    /// May succeed on retry
    #[error("transient recognition failure: {0}")]
    Transient(String),
    /// Will never succeed for this input
    #[error("fatal recognition failure: {0}")]
    Fatal(String),
}

/// Error from an audio decoder
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("file not found: {0}")]
    NotFound(PathBuf),
    #[error("unsupported audio format: {0}")]
    Unsupported(String),
    #[error("corrupt audio: {0}")]
    Corrupt(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DecodeError {
    /// Whether retrying the same file can never help
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}

/// Turns a file into samples
pub trait AudioDecoder: Send + Sync {
    fn decode(&self, path: &Path) -> Result<DecodedAudio, DecodeError>;
}

/// Turns samples into timestamped segments
pub trait Recognizer: Send + Sync {
    fn recognize(&self, audio: &DecodedAudio) -> Result<Vec<Segment>, RecognitionError>;
}

/// Renders a transcript somewhere and returns where
pub trait TranscriptWriter: Send + Sync {
    fn write(&self, transcript: &FileTranscript) -> anyhow::Result<PathBuf>;
}

/// How tasks are executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Blocking pool, one shared pipeline
    Shared,
    /// One OS thread per task, owned pipeline, framed messages
    Isolated,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::Shared
    }
}

/// Workers to use when none are configured
pub fn default_workers(mode: ExecutionMode, gpu_backed: bool, gpu_worker_cap: usize) -> usize {
    let cores = num_cpus::get().max(1);
    match mode {
        ExecutionMode::Shared => (cores * 2).min(8),
        ExecutionMode::Isolated if gpu_backed => cores.min(gpu_worker_cap.max(1)),
        ExecutionMode::Isolated => cores,
    }
}

/// One file to process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub path: PathBuf,
    /// 1 for the first try
    pub attempt: u32,
}

impl Job {
    pub fn new(path: impl Into<PathBuf>, attempt: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            path: path.into(),
            attempt,
        }
    }
}

/// Why a task did not produce a transcript
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskFailure {
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Fatal(String),
}

impl TaskFailure {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Fatal(m) => m,
        }
    }

    /// Library error for this failure
    pub fn into_error(self, path: &Path) -> BatchError {
        match self {
            Self::Transient(message) => BatchError::TransientRecognition(message),
            Self::Fatal(message) => BatchError::FatalFile {
                path: path.to_path_buf(),
                message,
            },
        }
    }
}

impl From<RecognitionError> for TaskFailure {
    fn from(err: RecognitionError) -> Self {
        match err {
            RecognitionError::Transient(m) => Self::Transient(m),
            RecognitionError::Fatal(m) => Self::Fatal(m),
        }
    }
}

impl From<DecodeError> for TaskFailure {
    fn from(err: DecodeError) -> Self {
        if err.is_fatal() {
            Self::Fatal(err.to_string())
        } else {
            Self::Transient(err.to_string())
        }
    }
}

/// The single message a task sends back to the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub job: Job,
    pub outcome: Result<FileTranscript, TaskFailure>,
    /// Runner that executed the task
    pub worker: String,
    pub elapsed_ms: u64,
}

impl TaskReport {
    fn failed(job: Job, worker: impl Into<String>, failure: TaskFailure) -> Self {
        Self {
            job,
            outcome: Err(failure),
            worker: worker.into(),
            elapsed_ms: 0,
        }
    }
}

/// Decode, recognize, analyse, merge, score, write
#[derive(Clone)]
pub struct Pipeline {
    decoder: Arc<dyn AudioDecoder>,
    recognizer: Arc<dyn Recognizer>,
    writer: Option<Arc<dyn TranscriptWriter>>,
    analyzer: SegmentAnalyzer,
    merger: SegmentMerger,
    quality: QualityMetricsCalculator,
}

impl Pipeline {
    pub fn new(decoder: Arc<dyn AudioDecoder>, recognizer: Arc<dyn Recognizer>) -> Self {
        Self {
            decoder,
            recognizer,
            writer: None,
            analyzer: SegmentAnalyzer::new(),
            merger: SegmentMerger::default(),
            quality: QualityMetricsCalculator::default(),
        }
    }

    pub fn with_writer(mut self, writer: Arc<dyn TranscriptWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn with_merge_config(mut self, config: MergeConfig) -> Self {
        self.merger = SegmentMerger::new(config);
        self
    }

    pub fn with_quality_config(mut self, config: QualityConfig) -> Self {
        self.quality = QualityMetricsCalculator::new(config);
        self
    }

    /// Run one file through every stage
    pub fn process(&self, path: &Path) -> Result<FileTranscript, TaskFailure> {
        let started = Instant::now();

        let audio = self.decoder.decode(path)?;
        if !validate_audio(&audio) {
            return Err(TaskFailure::Fatal(format!(
                "decoded audio is empty or malformed ({} samples, {} Hz, {} channel(s))",
                audio.audio.len(),
                audio.sample_rate,
                audio.channels
            )));
        }
        let raw = self.recognizer.recognize(&audio)?;

        let analysis = self.analyzer.analyze(&raw);
        let segments = self.merger.merge(&raw, &analysis);
        let quality = self.quality.calculate(&segments);

        let mut transcript = FileTranscript {
            source: path.to_path_buf(),
            raw_segment_count: raw.len(),
            segments,
            analysis,
            quality,
            output_path: None,
            audio_duration: audio.duration(),
            processing_time_ms: 0,
        };

        if let Some(writer) = &self.writer {
            let output = writer
                .write(&transcript)
                .map_err(|e| TaskFailure::Transient(format!("failed to write transcript: {:#}", e)))?;
            transcript.output_path = Some(output);
        }

        transcript.processing_time_ms = started.elapsed().as_millis() as u64;
        debug!(
            "Processed {}: {} -> {} segments in {}ms",
            path.display(),
            transcript.raw_segment_count,
            transcript.segments.len(),
            transcript.processing_time_ms
        );
        Ok(transcript)
    }
}

/// Run a job, turning panics into transient failures
fn run_job(pipeline: &Pipeline, job: Job, worker: &str) -> TaskReport {
    let started = Instant::now();
    let outcome = match catch_unwind(AssertUnwindSafe(|| pipeline.process(&job.path))) {
        Ok(outcome) => outcome,
        Err(_) => {
            error!("Worker {} panicked on {}", worker, job.path.display());
            Err(TaskFailure::Transient("worker panicked".to_string()))
        }
    };

    TaskReport {
        job,
        outcome,
        worker: worker.to_string(),
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}

/// Executes jobs; every spawned job sends exactly one report
pub trait TaskRunner: Send + Sync {
    fn mode(&self) -> ExecutionMode;
    fn spawn(&self, job: Job, reports: mpsc::UnboundedSender<TaskReport>);
}

/// Runs jobs on the blocking pool against one shared pipeline
pub struct SharedRunner {
    pipeline: Arc<Pipeline>,
}

impl SharedRunner {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }
}

impl TaskRunner for SharedRunner {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Shared
    }

    fn spawn(&self, job: Job, reports: mpsc::UnboundedSender<TaskReport>) {
        let pipeline = Arc::clone(&self.pipeline);
        tokio::task::spawn_blocking(move || {
            let report = run_job(&pipeline, job, "shared");
            if reports.send(report).is_err() {
                warn!("Coordinator gone, dropping task report");
            }
        });
    }
}

/// Runs each job on its own thread with an owned pipeline
pub struct IsolatedRunner {
    pipeline: Pipeline,
}

impl IsolatedRunner {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }
}

impl TaskRunner for IsolatedRunner {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Isolated
    }

    fn spawn(&self, job: Job, reports: mpsc::UnboundedSender<TaskReport>) {
        let name = format!("transcribe-{}", &job.id.simple().to_string()[..8]);

        let job_frame = match encode_frame(&job) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = reports.send(TaskReport::failed(job, name, TaskFailure::Transient(e.to_string())));
                return;
            }
        };

        let (frame_tx, frame_rx) = oneshot::channel::<String>();
        let pipeline = self.pipeline.clone();
        let thread_name = name.clone();

        let spawned = std::thread::Builder::new().name(name.clone()).spawn(move || {
            let report_frame = match decode_frame::<Job>(&job_frame) {
                Ok(job) => encode_frame(&run_job(&pipeline, job, &thread_name)),
                Err(e) => Err(e),
            };
            match report_frame {
                Ok(frame) => {
                    let _ = frame_tx.send(frame);
                }
                Err(e) => error!("Worker {} could not frame its report: {}", thread_name, e),
            }
        });

        if let Err(e) = spawned {
            error!("Failed to spawn worker thread {}: {}", name, e);
            let _ = reports.send(TaskReport::failed(
                job,
                name,
                TaskFailure::Transient(format!("failed to spawn worker: {}", e)),
            ));
            return;
        }

        // the job copy stays here so a lost frame still yields a report
        tokio::spawn(async move {
            let report = match frame_rx.await {
                Ok(frame) => decode_frame::<TaskReport>(&frame).unwrap_or_else(|e| {
                    TaskReport::failed(job, name.as_str(), TaskFailure::Transient(format!("bad report frame: {}", e)))
                }),
                Err(_) => TaskReport::failed(
                    job,
                    name.as_str(),
                    TaskFailure::Transient("worker exited without a report".to_string()),
                ),
            };
            if reports.send(report).is_err() {
                warn!("Coordinator gone, dropping task report");
            }
        });
    }
}

/// Build the runner for a mode
pub fn runner_for(mode: ExecutionMode, pipeline: Pipeline) -> Box<dyn TaskRunner> {
    info!("Using {:?} execution", mode);
    match mode {
        ExecutionMode::Shared => Box::new(SharedRunner::new(pipeline)),
        ExecutionMode::Isolated => Box::new(IsolatedRunner::new(pipeline)),
    }
}

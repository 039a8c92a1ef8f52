use anyhow::{bail, Context, Result};
use batch_transcriber::{
    analysis::{MergeConfig, QualityConfig},
    monitor::{MemoryConfig, MemoryMonitor},
    protocol::{DecodedAudio, FileTranscript},
    scheduler::{AbortHandle, BatchScheduler, BatchSummary, SchedulerConfig},
    state::{read_state, remove_state_file, state_file_path, BatchStateStore, StoreConfig},
    tracker::{EventKind, ProgressEvent},
    worker::{AudioDecoder, CommandConfig, CommandRecognizer, DecodeError, ExecutionMode, Pipeline, TranscriptWriter},
    utils::path_key,
    DEFAULT_STATE_DIR,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "batch-transcriber")]
#[command(about = "Resumable batch transcription of audio files")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Log level (RUST_LOG takes precedence)
    #[arg(long, value_enum, default_value = "info", global = true)]
    log_level: LogLevel,

    /// Directory holding batch state files
    #[arg(long, default_value = DEFAULT_STATE_DIR, global = true)]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Transcribe files, resuming the batch if it already exists
    Run(RunArgs),

    /// Show statistics for a batch
    Status {
        #[arg(long)]
        batch_id: String,
    },

    /// Remove a batch's state file
    Cleanup {
        #[arg(long)]
        batch_id: String,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Audio files or directories of .wav files
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Batch identifier, reuse it to resume (defaults to a timestamp)
    #[arg(long)]
    batch_id: Option<String>,

    /// Directory for JSON transcripts
    #[arg(long, default_value = "transcripts")]
    output_dir: PathBuf,

    /// Number of workers (auto-sized when omitted)
    #[arg(long)]
    workers: Option<usize>,

    /// Task execution mode
    #[arg(long, value_enum, default_value = "shared")]
    mode: Mode,

    /// Recognition runs on a GPU
    #[arg(long)]
    gpu: bool,

    /// Maximum isolated workers when --gpu is set
    #[arg(long, default_value = "2")]
    gpu_worker_cap: usize,

    /// Attempts per file before a transient failure is final
    #[arg(long, default_value = "3")]
    max_retries: u32,

    /// Seconds between memory checks while paused
    #[arg(long, default_value = "5")]
    pause_poll_secs: u64,

    /// Delete the state file once every file succeeded or was skipped
    #[arg(long)]
    cleanup: bool,

    /// Recognizer command
    #[arg(long, default_value = "uv")]
    recognizer_cmd: String,

    /// Recognizer arguments
    #[arg(long, default_value = "run python/recognize.py")]
    recognizer_args: String,

    /// Working directory for the recognizer
    #[arg(long)]
    recognizer_workdir: Option<PathBuf>,

    /// Mean confidence below which segments are never merged
    #[arg(long, default_value = "-1.5", allow_hyphen_values = true)]
    low_confidence_cutoff: f64,

    /// Early-minus-late confidence drop that counts as degradation
    #[arg(long, default_value = "0.3")]
    degradation_threshold: f64,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
enum Mode {
    Shared,
    Isolated,
}

impl From<Mode> for ExecutionMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Shared => ExecutionMode::Shared,
            Mode::Isolated => ExecutionMode::Isolated,
        }
    }
}

/// Decodes WAV files with `hound`
struct WavDecoder;

impl AudioDecoder for WavDecoder {
    fn decode(&self, path: &Path) -> std::result::Result<DecodedAudio, DecodeError> {
        let mut reader = hound::WavReader::open(path).map_err(|e| match e {
            hound::Error::IoError(io) if io.kind() == std::io::ErrorKind::NotFound => {
                DecodeError::NotFound(path.to_path_buf())
            }
            hound::Error::IoError(io) => DecodeError::Io(io),
            hound::Error::Unsupported => DecodeError::Unsupported(path.display().to_string()),
            other => DecodeError::Corrupt(other.to_string()),
        })?;

        let spec = reader.spec();
        let samples: std::result::Result<Vec<f32>, hound::Error> = match spec.sample_format {
            hound::SampleFormat::Float => reader.samples::<f32>().collect(),
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect()
            }
        };
        let samples = samples.map_err(|e| DecodeError::Corrupt(format!("failed to read samples: {}", e)))?;

        Ok(DecodedAudio::new(path, samples, spec.sample_rate, spec.channels))
    }
}

/// Writes each transcript as pretty JSON into a directory
struct JsonTranscriptWriter {
    output_dir: PathBuf,
}

impl JsonTranscriptWriter {
    /// `<stem>-<id>.json`, with `id` taken from the source's state key
    fn target_for(&self, source: &Path) -> PathBuf {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "transcript".to_string());
        let id = Uuid::new_v5(&Uuid::NAMESPACE_URL, path_key(source).as_bytes()).simple().to_string();
        self.output_dir.join(format!("{}-{}.json", stem, &id[..8]))
    }
}

impl TranscriptWriter for JsonTranscriptWriter {
    fn write(&self, transcript: &FileTranscript) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("Failed to create {}", self.output_dir.display()))?;

        let target = self.target_for(&transcript.source);

        let data = serde_json::to_vec_pretty(transcript).context("Failed to serialize transcript")?;
        let mut file = tempfile::NamedTempFile::new_in(&self.output_dir)?;
        file.write_all(&data)?;
        file.persist(&target)
            .with_context(|| format!("Failed to write {}", target.display()))?;

        Ok(target)
    }
}

/// Expand directories into the .wav files they contain, sorted
fn collect_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut found: Vec<PathBuf> = std::fs::read_dir(input)
                .with_context(|| format!("Failed to read {}", input.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| {
                    p.extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| e.eq_ignore_ascii_case("wav"))
                })
                .collect();
            found.sort();
            files.extend(found);
        } else {
            files.push(input.clone());
        }
    }
    Ok(files)
}

fn log_event(event: &ProgressEvent) {
    match &event.kind {
        EventKind::Started { total } => info!("Processing {} file(s)", total),
        EventKind::SegmentCompleted { .. } => {}
        EventKind::Milestone {
            percent,
            completed,
            total,
            eta_seconds,
            ..
        } => info!("{}% complete ({}/{}), ETA {:.0}s", percent, completed, total, eta_seconds),
        EventKind::QualityWarning { message, severity, .. } => {
            warn!("Quality ({:?}): {}", severity, message)
        }
        EventKind::Error { message, .. } => error!("{}", message),
        EventKind::Completed {
            completed,
            total_time_seconds,
            avg_time_per_unit,
        } => info!(
            "Finished {} file(s) in {:.1}s ({:.2}s per file)",
            completed, total_time_seconds, avg_time_per_unit
        ),
    }
}

/// Abort admissions on Ctrl+C or TERM
fn spawn_signal_handler(abort: AbortHandle) {
    tokio::spawn(async move {
        tokio::select! {
            _ = signal::ctrl_c() => info!("Received Ctrl+C signal"),
            _ = wait_for_term_signal() => info!("Received TERM signal"),
        }
        info!("Finishing in-flight files, the batch can be resumed later");
        abort.abort();
    });
}

#[cfg(unix)]
async fn wait_for_term_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    if let Ok(mut stream) = signal(SignalKind::terminate()) {
        stream.recv().await;
    }
}

#[cfg(not(unix))]
async fn wait_for_term_signal() {
    futures::future::pending::<()>().await;
}

fn print_summary(summary: &BatchSummary) {
    let stats = &summary.statistics;
    println!("Batch {}", summary.batch_id);
    println!(
        "  {} total, {} completed, {} failed, {} skipped, {} pending",
        stats.total, stats.completed, stats.failed, stats.skipped, stats.pending
    );
    println!(
        "  success rate {:.1}%, {:.2} files/s over {:.1}s",
        summary.success_rate * 100.0,
        summary.throughput,
        summary.elapsed.as_secs_f64()
    );
    if summary.pauses > 0 {
        println!("  paused {} time(s) for memory", summary.pauses);
    }
    if summary.persistence_errors > 0 {
        println!("  {} state write(s) failed", summary.persistence_errors);
    }
    if summary.aborted {
        println!("  aborted, rerun with --batch-id {} to resume", summary.batch_id);
    }
    for (path, error) in &summary.failures {
        println!("  {}: {}", path.display(), error);
    }
}

async fn run(state_dir: &Path, args: RunArgs) -> Result<()> {
    let batch_id = args
        .batch_id
        .clone()
        .unwrap_or_else(|| format!("batch_{}", chrono::Local::now().format("%Y%m%d_%H%M%S")));
    let files = collect_inputs(&args.inputs)?;
    if files.is_empty() {
        bail!("No audio files found");
    }

    let store = BatchStateStore::open(
        state_dir,
        &batch_id,
        StoreConfig {
            retry_cap: Some(args.max_retries),
        },
    )
    .context("Failed to open batch state")?;

    let recognizer = CommandRecognizer::with_config(CommandConfig {
        program: args.recognizer_cmd.clone(),
        args: args.recognizer_args.split_whitespace().map(String::from).collect(),
        working_dir: args.recognizer_workdir.clone(),
        env_vars: Vec::new(),
    });

    let pipeline = Pipeline::new(Arc::new(WavDecoder), Arc::new(recognizer))
        .with_writer(Arc::new(JsonTranscriptWriter {
            output_dir: args.output_dir.clone(),
        }))
        .with_merge_config(MergeConfig {
            low_confidence_cutoff: args.low_confidence_cutoff,
            ..MergeConfig::default()
        })
        .with_quality_config(QualityConfig {
            degradation_threshold: args.degradation_threshold,
            ..QualityConfig::default()
        });

    let config = SchedulerConfig {
        mode: args.mode.into(),
        workers: args.workers,
        gpu_backed: args.gpu,
        gpu_worker_cap: args.gpu_worker_cap,
        max_retries: args.max_retries,
        pause_poll_interval: Duration::from_secs(args.pause_poll_secs),
        cleanup_on_success: args.cleanup,
    };

    info!("Configuration:");
    info!("  Batch: {} ({} file(s))", batch_id, files.len());
    info!("  State dir: {}", state_dir.display());
    info!("  Output dir: {}", args.output_dir.display());
    info!("  Mode: {:?}, workers: {}", config.mode, config.worker_count());
    info!("  Recognizer: {} {}", args.recognizer_cmd, args.recognizer_args);

    let mut scheduler = BatchScheduler::new(config, pipeline, store, MemoryMonitor::with_config(MemoryConfig::default()));
    spawn_signal_handler(scheduler.abort_handle());

    let (event_tx, mut event_rx) = mpsc::channel::<ProgressEvent>(1024);
    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            log_event(&event);
        }
    });

    let summary = scheduler.run(files, event_tx).await;
    // the tracker, and with it the sender, is gone once run returns
    let _ = printer.await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn status(state_dir: &Path, batch_id: &str) -> Result<()> {
    let file = state_file_path(state_dir, batch_id);
    let state = read_state(&file).with_context(|| format!("Failed to read {}", file.display()))?;
    let stats = state.statistics;

    println!("Batch {} (created {})", state.batch_id, state.created_at.to_rfc3339());
    println!("  total:       {}", stats.total);
    println!("  pending:     {}", stats.pending);
    println!("  in progress: {}", stats.in_progress);
    println!("  completed:   {}", stats.completed);
    println!("  failed:      {}", stats.failed);
    println!("  skipped:     {}", stats.skipped);
    println!("  success:     {:.1}%", stats.success_rate() * 100.0);
    Ok(())
}

fn cleanup(state_dir: &Path, batch_id: &str) -> Result<()> {
    let file = state_file_path(state_dir, batch_id);
    remove_state_file(&file).with_context(|| format!("Failed to remove {}", file.display()))?;
    println!("Removed batch state {}", batch_id);
    Ok(())
}

fn init_tracing(level: LogLevel) {
    let level: tracing::Level = level.into();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level);

    info!("Starting batch-transcriber v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Run(args) => run(&cli.state_dir, args).await,
        Commands::Status { batch_id } => status(&cli.state_dir, &batch_id),
        Commands::Cleanup { batch_id } => cleanup(&cli.state_dir, &batch_id),
    }
}

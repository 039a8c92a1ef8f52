//! Batch coordinator.
//!
//! The scheduler owns the state store, the progress tracker and the memory
//! monitor. Tasks never touch any of them: each task sends one `TaskReport`
//! over a channel and the coordinator loop applies it. A batch moves through
//! `Created -> Running <-> Paused -> Draining -> Finished`.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use crate::analysis::QualityTier;
use crate::monitor::MemoryMonitor;
use crate::state::{BatchStateStore, BatchStatistics, FileStatus, StatusMetadata};
use crate::tracker::{ProgressSink, ProgressTracker, Severity};
use crate::worker::{default_workers, runner_for, ExecutionMode, Job, Pipeline, TaskReport, TaskRunner};
use crate::BatchError;

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub mode: ExecutionMode,
    /// Explicit worker count, auto-sized when `None`
    pub workers: Option<usize>,
    /// Recognition runs on a GPU, which limits isolated workers
    pub gpu_backed: bool,
    pub gpu_worker_cap: usize,
    /// Attempts a file gets before a transient failure becomes terminal
    pub max_retries: u32,
    /// How often a paused batch re-checks memory
    pub pause_poll_interval: Duration,
    /// Remove the state file when every file ended in success or skipped
    pub cleanup_on_success: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Shared,
            workers: None,
            gpu_backed: false,
            gpu_worker_cap: 2,
            max_retries: 3,
            pause_poll_interval: Duration::from_secs(5),
            cleanup_on_success: false,
        }
    }
}

impl SchedulerConfig {
    /// Worker count after applying overrides
    pub fn worker_count(&self) -> usize {
        match self.workers {
            Some(workers) => workers.max(1),
            None => default_workers(self.mode, self.gpu_backed, self.gpu_worker_cap),
        }
    }
}

/// Lifecycle of a batch run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPhase {
    Created,
    Running,
    Paused,
    Draining,
    Finished,
}

/// Stops admission of new tasks from anywhere
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    aborted: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// Outcome of a batch run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub statistics: BatchStatistics,
    /// Completed over total
    pub success_rate: f64,
    /// Failed and skipped files with their last error
    pub failures: Vec<(PathBuf, String)>,
    pub persistence_errors: usize,
    /// Times admission was paused for memory
    pub pauses: usize,
    pub aborted: bool,
    pub elapsed: Duration,
    /// Files that reached a terminal status in this run
    pub processed: usize,
    /// Processed files per second
    pub throughput: f64,
}

/// Runs a batch of files through a bounded worker pool
pub struct BatchScheduler {
    config: SchedulerConfig,
    runner: Box<dyn TaskRunner>,
    store: BatchStateStore,
    monitor: MemoryMonitor,
    abort: AbortHandle,
    phase: BatchPhase,
}

impl BatchScheduler {
    pub fn new(config: SchedulerConfig, pipeline: Pipeline, store: BatchStateStore, monitor: MemoryMonitor) -> Self {
        let runner = runner_for(config.mode, pipeline);
        Self::with_runner(config, runner, store, monitor)
    }

    pub fn with_runner(
        config: SchedulerConfig,
        runner: Box<dyn TaskRunner>,
        store: BatchStateStore,
        monitor: MemoryMonitor,
    ) -> Self {
        Self {
            config,
            runner,
            store,
            monitor,
            abort: AbortHandle::default(),
            phase: BatchPhase::Created,
        }
    }

    /// Share an existing handle, e.g. one owned by a signal handler
    pub fn with_abort_handle(mut self, abort: AbortHandle) -> Self {
        self.abort = abort;
        self
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn phase(&self) -> BatchPhase {
        self.phase
    }

    pub fn store(&self) -> &BatchStateStore {
        &self.store
    }

    fn set_phase(&mut self, phase: BatchPhase) {
        if self.phase != phase {
            debug!("Batch {}: {:?} -> {:?}", self.store.batch_id(), self.phase, phase);
            self.phase = phase;
        }
    }

    /// Process `paths`, resuming whatever the store already knows about them
    pub async fn run(&mut self, paths: Vec<PathBuf>, sink: impl ProgressSink + 'static) -> BatchSummary {
        let started = Instant::now();
        let workers = self.config.worker_count();
        let mut run = RunState::default();

        self.set_phase(BatchPhase::Running);

        if let Err(e) = self.store.register_all(paths.iter().map(PathBuf::as_path)) {
            run.persistence_failed(&e);
        }

        let mut queue: VecDeque<PathBuf> = self
            .store
            .pending_files()
            .into_iter()
            .filter(|p| self.retry_allowed(p))
            .collect();

        info!(
            "Starting batch {}: {} file(s) to process, {} already done, {} {:?} worker(s)",
            self.store.batch_id(),
            queue.len(),
            self.store.statistics().total as usize - queue.len(),
            workers,
            self.runner.mode()
        );

        let mut tracker = ProgressTracker::new(queue.len(), sink);
        let (report_tx, mut report_rx) = mpsc::unbounded_channel::<TaskReport>();
        let mut in_flight = 0usize;

        loop {
            if self.abort.is_aborted() && self.phase != BatchPhase::Draining {
                info!("Abort requested, draining {} in-flight task(s)", in_flight);
                self.set_phase(BatchPhase::Draining);
            }

            while self.phase != BatchPhase::Draining && in_flight < workers && !queue.is_empty() {
                if !self.monitor.should_continue() {
                    if self.phase != BatchPhase::Paused {
                        run.pauses += 1;
                        let reason = BatchError::MemoryPressure(format!(
                            "pausing admissions with {} in flight and {} queued",
                            in_flight,
                            queue.len()
                        ));
                        warn!("{}", reason);
                        self.set_phase(BatchPhase::Paused);
                    }
                    break;
                }
                if self.phase == BatchPhase::Paused {
                    info!("Memory recovered, resuming admissions");
                    self.set_phase(BatchPhase::Running);
                }

                let Some(path) = queue.pop_front() else { break };
                self.admit(path, &report_tx, &mut run);
                in_flight += 1;
            }

            if in_flight == 0 && (queue.is_empty() || self.phase == BatchPhase::Draining) {
                break;
            }

            if self.phase == BatchPhase::Paused {
                tokio::select! {
                    Some(report) = report_rx.recv(), if in_flight > 0 => {
                        in_flight -= 1;
                        self.handle_report(report, &mut queue, &mut tracker, &mut run);
                    }
                    _ = tokio::time::sleep(self.config.pause_poll_interval) => {}
                    _ = self.abort.notify.notified() => {}
                }
            } else if let Some(report) = report_rx.recv().await {
                in_flight -= 1;
                self.handle_report(report, &mut queue, &mut tracker, &mut run);
            }
        }

        tracker.completed();
        self.set_phase(BatchPhase::Finished);

        let aborted = self.abort.is_aborted();
        let statistics = self.store.statistics();
        if self.config.cleanup_on_success
            && !aborted
            && statistics.pending + statistics.in_progress + statistics.failed == 0
        {
            if let Err(e) = self.store.cleanup() {
                run.persistence_failed(&e);
            }
        }

        self.summarize(started.elapsed(), aborted, run)
    }

    /// Failed files from earlier runs are only retried while attempts remain
    fn retry_allowed(&self, path: &Path) -> bool {
        match self.store.record(path) {
            Some(record) if record.status == FileStatus::Failed => record.attempts < self.config.max_retries,
            _ => true,
        }
    }

    fn admit(&mut self, path: PathBuf, reports: &mpsc::UnboundedSender<TaskReport>, run: &mut RunState) {
        let attempt = self.store.record(&path).map_or(0, |r| r.attempts) + 1;

        if let Err(e) = self.store.set_status(&path, FileStatus::InProgress, StatusMetadata::default()) {
            run.persistence_failed(&e);
        }

        debug!("Admitting {} (attempt {})", path.display(), attempt);
        self.runner.spawn(Job::new(path, attempt), reports.clone());
    }

    fn handle_report(
        &mut self,
        report: TaskReport,
        queue: &mut VecDeque<PathBuf>,
        tracker: &mut ProgressTracker,
        run: &mut RunState,
    ) {
        let path = report.job.path;

        match report.outcome {
            Ok(transcript) => {
                let metadata = StatusMetadata {
                    error: None,
                    output_path: transcript.output_path.clone(),
                };
                if let Err(e) = self.store.set_status(&path, FileStatus::Success, metadata) {
                    run.persistence_failed(&e);
                }

                let quality = &transcript.quality;
                if quality.degradation_detected {
                    tracker.quality_warning(
                        format!(
                            "{}: confidence dropped by {:.2} from early to late segments",
                            path.display(),
                            quality.early_vs_late_diff
                        ),
                        Severity::High,
                    );
                }
                if quality.quality_tier == QualityTier::Poor {
                    tracker.quality_warning(
                        format!(
                            "{}: poor transcription quality (mean confidence {:.2})",
                            path.display(),
                            quality.confidence_simple_avg
                        ),
                        Severity::Medium,
                    );
                }

                info!(
                    "Completed {} by {} in {}ms ({} segments, {})",
                    path.display(),
                    report.worker,
                    report.elapsed_ms,
                    transcript.segments.len(),
                    quality.quality_tier
                );
                run.processed += 1;
                tracker.segment_completed(path, FileStatus::Success);
            }
            Err(failure) if failure.is_fatal() => {
                let err = failure.into_error(&path);
                warn!("Skipping {}", err);
                if let Err(e) = self.store.set_status(&path, FileStatus::Skipped, StatusMetadata::error(err.to_string())) {
                    run.persistence_failed(&e);
                }
                run.processed += 1;
                tracker.error_occurred(err.to_string());
                tracker.segment_completed(path, FileStatus::Skipped);
            }
            Err(failure) => {
                let message = failure.message().to_string();
                if let Err(e) = self.store.set_status(&path, FileStatus::Failed, StatusMetadata::error(message.as_str())) {
                    run.persistence_failed(&e);
                }

                let attempts = self.store.record(&path).map_or(u32::MAX, |r| r.attempts);
                if attempts >= self.config.max_retries {
                    let err = failure.into_error(&path);
                    error!("Giving up on {} after {} attempt(s): {}", path.display(), attempts, err);
                    run.processed += 1;
                    tracker.error_occurred(format!("{}: {}", path.display(), err));
                    tracker.segment_completed(path, FileStatus::Failed);
                } else if self.abort.is_aborted() {
                    info!(
                        "Attempt {} of {} failed for {}: {}, deferred to the next run",
                        attempts,
                        self.config.max_retries,
                        path.display(),
                        message
                    );
                } else {
                    warn!(
                        "Attempt {} of {} failed for {}: {}, re-queued",
                        attempts,
                        self.config.max_retries,
                        path.display(),
                        message
                    );
                    queue.push_back(path);
                }
            }
        }
    }

    fn summarize(&self, elapsed: Duration, aborted: bool, run: RunState) -> BatchSummary {
        let statistics = self.store.statistics();
        let failures = self
            .store
            .records()
            .into_iter()
            .filter(|r| matches!(r.status, FileStatus::Failed | FileStatus::Skipped))
            .map(|r| (r.path.clone(), r.last_error.clone().unwrap_or_default()))
            .collect();

        let seconds = elapsed.as_secs_f64();
        let throughput = if seconds > 0.0 {
            run.processed as f64 / seconds
        } else {
            0.0
        };

        let summary = BatchSummary {
            batch_id: self.store.batch_id().to_string(),
            statistics,
            success_rate: statistics.success_rate(),
            failures,
            persistence_errors: run.persistence_errors,
            pauses: run.pauses,
            aborted,
            elapsed,
            processed: run.processed,
            throughput,
        };

        info!(
            "Batch {} finished: {} completed, {} failed, {} skipped of {} in {:.1}s ({:.2} files/s)",
            summary.batch_id,
            statistics.completed,
            statistics.failed,
            statistics.skipped,
            statistics.total,
            seconds,
            throughput
        );
        summary
    }
}

/// Counters for one `run` call
#[derive(Debug, Default)]
struct RunState {
    processed: usize,
    pauses: usize,
    persistence_errors: usize,
}

impl RunState {
    fn persistence_failed(&mut self, err: &BatchError) {
        self.persistence_errors += 1;
        error!("Batch state not persisted: {}", err);
    }
}

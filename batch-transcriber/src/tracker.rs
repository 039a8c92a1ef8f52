use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::state::FileStatus;

/// Progress milestones in percent
pub const MILESTONES: [u8; 4] = [25, 50, 75, 100];

/// Severity of a quality warning
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Started {
        total: usize,
    },
    SegmentCompleted {
        number: usize,
        total: usize,
        path: PathBuf,
        status: FileStatus,
    },
    Milestone {
        percent: u8,
        completed: usize,
        total: usize,
        elapsed_seconds: f64,
        eta_seconds: f64,
    },
    QualityWarning {
        message: String,
        severity: Severity,
        completed: usize,
    },
    Error {
        message: String,
        completed: usize,
    },
    Completed {
        completed: usize,
        total_time_seconds: f64,
        avg_time_per_unit: f64,
    },
}

/// A progress notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl ProgressEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// Receiver of progress events
pub trait ProgressSink: Send {
    fn emit(&self, event: &ProgressEvent) -> anyhow::Result<()>;
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressEvent) -> anyhow::Result<()> + Send,
{
    fn emit(&self, event: &ProgressEvent) -> anyhow::Result<()> {
        self(event)
    }
}

impl ProgressSink for mpsc::Sender<ProgressEvent> {
    fn emit(&self, event: &ProgressEvent) -> anyhow::Result<()> {
        // never wait on a slow consumer
        self.try_send(event.clone())
            .map_err(|e| anyhow::anyhow!("progress channel: {}", e))
    }
}

impl ProgressSink for mpsc::UnboundedSender<ProgressEvent> {
    fn emit(&self, event: &ProgressEvent) -> anyhow::Result<()> {
        self.send(event.clone())
            .map_err(|_| anyhow::anyhow!("progress channel closed"))
    }
}

/// Sink that drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: &ProgressEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Turns completions into milestone events
pub struct ProgressTracker {
    total: usize,
    completed: usize,
    started: Instant,
    milestones_hit: BTreeSet<u8>,
    sink: Box<dyn ProgressSink>,
}

impl ProgressTracker {
    /// Create a tracker and emit `Started`
    pub fn new(total: usize, sink: impl ProgressSink + 'static) -> Self {
        let tracker = Self {
            total,
            completed: 0,
            started: Instant::now(),
            milestones_hit: BTreeSet::new(),
            sink: Box::new(sink),
        };
        tracker.emit(EventKind::Started { total });
        tracker
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn completed_count(&self) -> usize {
        self.completed
    }

    pub fn milestones_hit(&self) -> impl Iterator<Item = u8> + '_ {
        self.milestones_hit.iter().copied()
    }

    /// Record one finished unit of work
    pub fn segment_completed(&mut self, path: impl Into<PathBuf>, status: FileStatus) {
        self.completed += 1;
        let total = self.total.max(1);

        self.emit(EventKind::SegmentCompleted {
            number: self.completed,
            total: self.total,
            path: path.into(),
            status,
        });

        let percent = (self.completed.min(total) * 100 / total) as u8;
        let reached = percent / 25 * 25;

        for milestone in MILESTONES.into_iter().filter(|m| *m <= reached) {
            if !self.milestones_hit.insert(milestone) {
                continue;
            }
            let elapsed = self.started.elapsed().as_secs_f64();
            let eta = elapsed / self.completed as f64 * total.saturating_sub(self.completed) as f64;

            debug!("Reached {}% ({}/{})", milestone, self.completed, self.total);
            self.emit(EventKind::Milestone {
                percent: milestone,
                completed: self.completed,
                total: self.total,
                elapsed_seconds: elapsed,
                eta_seconds: eta,
            });
        }
    }

    pub fn quality_warning(&self, message: impl Into<String>, severity: Severity) {
        self.emit(EventKind::QualityWarning {
            message: message.into(),
            severity,
            completed: self.completed,
        });
    }

    pub fn error_occurred(&self, message: impl Into<String>) {
        self.emit(EventKind::Error {
            message: message.into(),
            completed: self.completed,
        });
    }

    /// Emit the final summary
    pub fn completed(&self) {
        let total_time = self.started.elapsed().as_secs_f64();
        let avg = if self.completed > 0 {
            total_time / self.completed as f64
        } else {
            0.0
        };
        self.emit(EventKind::Completed {
            completed: self.completed,
            total_time_seconds: total_time,
            avg_time_per_unit: avg,
        });
    }

    fn emit(&self, kind: EventKind) {
        let event = ProgressEvent::new(kind);
        match catch_unwind(AssertUnwindSafe(|| self.sink.emit(&event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Error in progress sink: {}", e),
            Err(_) => error!("Progress sink panicked"),
        }
    }
}

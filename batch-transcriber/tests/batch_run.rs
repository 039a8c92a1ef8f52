use batch_transcriber::{
    monitor::{MemoryConfig, MemoryMonitor, MemoryProbe, MemoryReading},
    protocol::{DecodedAudio, Segment},
    scheduler::{AbortHandle, BatchScheduler, SchedulerConfig},
    state::{BatchStateStore, FileStatus, StoreConfig},
    tracker::{EventKind, NullSink, ProgressEvent},
    utils::test_tone,
    worker::{AudioDecoder, DecodeError, ExecutionMode, Pipeline, RecognitionError, Recognizer},
};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

struct ToneDecoder;

impl AudioDecoder for ToneDecoder {
    fn decode(&self, path: &Path) -> Result<DecodedAudio, DecodeError> {
        Ok(test_tone(path, 1.0, 16000))
    }
}

/// Two confident segments per file; files whose name contains `flaky` always fail transiently
#[derive(Default)]
struct ScriptedRecognizer {
    calls: AtomicUsize,
    abort_after_first: Option<AbortHandle>,
}

impl Recognizer for ScriptedRecognizer {
    fn recognize(&self, audio: &DecodedAudio) -> Result<Vec<Segment>, RecognitionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(abort) = &self.abort_after_first {
            abort.abort();
        }

        let name = audio.source.to_string_lossy();
        if name.contains("flaky") {
            return Err(RecognitionError::Transient("backend timed out".to_string()));
        }
        Ok(vec![
            Segment::new(0.0, 0.4, "hello", -0.1),
            Segment::new(0.45, 1.0, "world", -0.2),
        ])
    }
}

struct Healthy;

impl MemoryProbe for Healthy {
    fn read(&self) -> Option<MemoryReading> {
        Some(MemoryReading {
            process_mb: 50.0,
            system_percent: 30.0,
            available_mb: 8000.0,
        })
    }
}

/// Replays readings, repeating the last one
struct ScriptedProbe(Mutex<VecDeque<MemoryReading>>);

impl MemoryProbe for ScriptedProbe {
    fn read(&self) -> Option<MemoryReading> {
        let mut readings = self.0.lock().unwrap();
        if readings.len() > 1 {
            readings.pop_front()
        } else {
            readings.front().copied()
        }
    }
}

fn reading(available_mb: f64) -> MemoryReading {
    MemoryReading {
        process_mb: 50.0,
        system_percent: 50.0,
        available_mb,
    }
}

fn files(names: &[&str]) -> Vec<PathBuf> {
    names.iter().map(PathBuf::from).collect()
}

fn build(
    dir: &TempDir,
    config: SchedulerConfig,
    recognizer: Arc<ScriptedRecognizer>,
    monitor: MemoryMonitor,
) -> BatchScheduler {
    let store = BatchStateStore::open(
        dir.path(),
        "integration",
        StoreConfig {
            retry_cap: Some(config.max_retries),
        },
    )
    .unwrap();
    let pipeline = Pipeline::new(Arc::new(ToneDecoder), recognizer);
    BatchScheduler::new(config, pipeline, store, monitor)
}

fn healthy() -> MemoryMonitor {
    MemoryMonitor::with_probe(MemoryConfig::default(), Healthy)
}

#[tokio::test]
async fn transient_failures_are_retried_until_the_cap() {
    let dir = TempDir::new().unwrap();
    let recognizer = Arc::new(ScriptedRecognizer::default());
    let config = SchedulerConfig {
        workers: Some(2),
        max_retries: 2,
        ..SchedulerConfig::default()
    };
    let mut scheduler = build(&dir, config, Arc::clone(&recognizer), healthy());

    let summary = scheduler.run(files(&["1.wav", "flaky.wav", "3.wav"]), NullSink).await;

    let stats = summary.statistics;
    assert_eq!((stats.total, stats.completed, stats.failed), (3, 2, 1));
    assert_eq!(stats.pending + stats.in_progress, 0);
    assert_eq!(recognizer.calls.load(Ordering::SeqCst), 4);

    let record = scheduler.store().record(Path::new("flaky.wav")).unwrap();
    assert_eq!(record.status, FileStatus::Failed);
    assert_eq!(record.attempts, 2);
    assert_eq!(record.last_error.as_deref(), Some("backend timed out"));
    assert_eq!(summary.failures, vec![(PathBuf::from("flaky.wav"), "backend timed out".to_string())]);
}

#[tokio::test]
async fn memory_pressure_pauses_then_resumes() {
    let dir = TempDir::new().unwrap();
    let probe = ScriptedProbe(Mutex::new(VecDeque::from(vec![
        reading(8000.0), // baseline
        reading(100.0),
        reading(8000.0),
    ])));
    let config = SchedulerConfig {
        workers: Some(1),
        pause_poll_interval: Duration::from_millis(10),
        ..SchedulerConfig::default()
    };
    let mut scheduler = build(
        &dir,
        config,
        Arc::new(ScriptedRecognizer::default()),
        MemoryMonitor::with_probe(MemoryConfig::default(), probe),
    );

    let summary = scheduler.run(files(&["a.wav", "b.wav"]), NullSink).await;

    assert!(summary.pauses >= 1);
    assert_eq!(summary.statistics.completed, 2);
    assert!(!summary.aborted);
}

#[tokio::test]
async fn milestones_are_emitted_once_in_order() {
    let dir = TempDir::new().unwrap();
    let mut scheduler = build(
        &dir,
        SchedulerConfig {
            workers: Some(3),
            ..SchedulerConfig::default()
        },
        Arc::new(ScriptedRecognizer::default()),
        healthy(),
    );
    let (tx, mut rx) = mpsc::unbounded_channel::<ProgressEvent>();

    scheduler.run(files(&["a.wav", "b.wav", "c.wav", "d.wav"]), tx).await;

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    assert!(matches!(events.first().unwrap().kind, EventKind::Started { total: 4 }));
    let milestones: Vec<u8> = events
        .iter()
        .filter_map(|e| match e.kind {
            EventKind::Milestone { percent, .. } => Some(percent),
            _ => None,
        })
        .collect();
    assert_eq!(milestones, vec![25, 50, 75, 100]);
    assert!(matches!(
        events.last().unwrap().kind,
        EventKind::Completed { completed: 4, .. }
    ));
}

#[tokio::test]
async fn aborted_batch_resumes_where_it_stopped() {
    let dir = TempDir::new().unwrap();
    let batch = files(&["a.wav", "b.wav", "c.wav"]);

    let stopper = AbortHandle::default();
    let first = {
        let recognizer = Arc::new(ScriptedRecognizer {
            abort_after_first: Some(stopper.clone()),
            ..ScriptedRecognizer::default()
        });
        let config = SchedulerConfig {
            workers: Some(1),
            ..SchedulerConfig::default()
        };
        let mut scheduler = build(&dir, config, recognizer, healthy()).with_abort_handle(stopper);
        scheduler.run(batch.clone(), NullSink).await
    };

    assert!(first.aborted);
    // the in-flight file was drained, nothing new was admitted
    assert_eq!(first.statistics.completed, 1);
    assert_eq!(first.statistics.pending, 2);
    assert_eq!(first.statistics.in_progress, 0);

    let recognizer = Arc::new(ScriptedRecognizer::default());
    let mut scheduler = build(&dir, SchedulerConfig::default(), Arc::clone(&recognizer), healthy());
    let second = scheduler.run(batch, NullSink).await;

    assert!(!second.aborted);
    assert_eq!(second.statistics.completed, 3);
    assert_eq!(second.processed, 2);
    assert_eq!(recognizer.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn resume_skips_exhausted_failures() {
    let dir = TempDir::new().unwrap();
    let config = SchedulerConfig {
        workers: Some(2),
        max_retries: 2,
        ..SchedulerConfig::default()
    };

    let mut scheduler = build(&dir, config.clone(), Arc::new(ScriptedRecognizer::default()), healthy());
    scheduler.run(files(&["a.wav", "flaky.wav"]), NullSink).await;
    drop(scheduler);

    let recognizer = Arc::new(ScriptedRecognizer::default());
    let mut scheduler = build(&dir, config, Arc::clone(&recognizer), healthy());
    let summary = scheduler.run(files(&["a.wav", "flaky.wav", "new.wav"]), NullSink).await;

    assert_eq!(recognizer.calls.load(Ordering::SeqCst), 1);
    let stats = summary.statistics;
    assert_eq!((stats.total, stats.completed, stats.failed), (3, 2, 1));
}

#[tokio::test]
async fn isolated_mode_processes_every_file() {
    let dir = TempDir::new().unwrap();
    let recognizer = Arc::new(ScriptedRecognizer::default());
    let config = SchedulerConfig {
        mode: ExecutionMode::Isolated,
        workers: Some(2),
        max_retries: 1,
        ..SchedulerConfig::default()
    };
    let mut scheduler = build(&dir, config, Arc::clone(&recognizer), healthy());

    let summary = scheduler
        .run(files(&["a.wav", "b.wav", "c.wav", "flaky.wav"]), NullSink)
        .await;

    let stats = summary.statistics;
    assert_eq!((stats.completed, stats.failed), (3, 1));
    assert_eq!(summary.processed, 4);

    let record = scheduler.store().record(Path::new("a.wav")).unwrap();
    assert_eq!(record.status, FileStatus::Success);
    assert!(record.completed_at.is_some());
}

#[tokio::test]
async fn transient_failure_during_abort_is_deferred_not_terminal() {
    let dir = TempDir::new().unwrap();
    let stopper = AbortHandle::default();
    let recognizer = Arc::new(ScriptedRecognizer {
        abort_after_first: Some(stopper.clone()),
        ..ScriptedRecognizer::default()
    });
    let config = SchedulerConfig {
        workers: Some(1),
        max_retries: 3,
        ..SchedulerConfig::default()
    };
    let mut scheduler = build(&dir, config.clone(), recognizer, healthy()).with_abort_handle(stopper);
    let (tx, mut rx) = mpsc::unbounded_channel::<ProgressEvent>();

    let first = scheduler.run(files(&["flaky.wav", "b.wav"]), tx).await;

    assert!(first.aborted);
    assert_eq!(first.processed, 0);
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(!events
        .iter()
        .any(|e| matches!(e.kind, EventKind::Error { .. } | EventKind::SegmentCompleted { .. })));

    let record = scheduler.store().record(Path::new("flaky.wav")).unwrap();
    assert_eq!((record.status, record.attempts), (FileStatus::Failed, 1));
    drop(scheduler);

    let recognizer = Arc::new(ScriptedRecognizer::default());
    let mut scheduler = build(&dir, config, Arc::clone(&recognizer), healthy());
    let second = scheduler.run(files(&["flaky.wav", "b.wav"]), NullSink).await;

    // two attempts left for flaky.wav, one for b.wav
    assert_eq!(recognizer.calls.load(Ordering::SeqCst), 3);
    assert_eq!(second.statistics.completed, 1);
    assert_eq!(scheduler.store().record(Path::new("flaky.wav")).unwrap().attempts, 3);
}

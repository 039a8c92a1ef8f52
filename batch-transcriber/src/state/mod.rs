//! Durable per-file batch state.
//!
//! Each batch lives in one pretty-printed JSON file at
//! `<state_dir>/<batch_id>.json`. Every mutation is written to a temporary
//! file in the same directory and renamed over the previous state, so a
//! crash leaves either the old or the new state on disk, never a torn one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

use crate::utils::path_key;
use crate::{BatchError, Result};

/// Processing status of a single file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    Skipped,
}

impl FileStatus {
    /// Whether the status ends processing for this run
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Path as it was registered
    pub path: PathBuf,
    pub status: FileStatus,
    /// Number of transitions into `Failed`
    pub attempts: u32,
    pub last_error: Option<String>,
    pub output_path: Option<PathBuf>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Registration order
    pub sequence: u64,
}

/// Optional outcome details recorded with a status change
#[derive(Debug, Clone, Default)]
pub struct StatusMetadata {
    pub error: Option<String>,
    pub output_path: Option<PathBuf>,
}

impl StatusMetadata {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            output_path: None,
        }
    }

    pub fn output(path: impl Into<PathBuf>) -> Self {
        Self {
            error: None,
            output_path: Some(path.into()),
        }
    }
}

/// Per-status counters; the buckets always sum to `total`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStatistics {
    pub total: u64,
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl BatchStatistics {
    fn from_records<'a>(records: impl Iterator<Item = &'a FileRecord>) -> Self {
        let mut stats = Self::default();
        for record in records {
            stats.total += 1;
            *stats.bucket_mut(record.status) += 1;
        }
        stats
    }

    fn bucket_mut(&mut self, status: FileStatus) -> &mut u64 {
        match status {
            FileStatus::Pending => &mut self.pending,
            FileStatus::InProgress => &mut self.in_progress,
            FileStatus::Success => &mut self.completed,
            FileStatus::Failed => &mut self.failed,
            FileStatus::Skipped => &mut self.skipped,
        }
    }

    /// Move one count between buckets
    fn transfer(&mut self, from: FileStatus, to: FileStatus) {
        if from == to {
            return;
        }
        let source = self.bucket_mut(from);
        *source = source.saturating_sub(1);
        *self.bucket_mut(to) += 1;
    }

    /// Sum of all buckets
    pub fn accounted(&self) -> u64 {
        self.pending + self.in_progress + self.completed + self.failed + self.skipped
    }

    /// Completed over total, 0 for an empty batch
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.completed as f64 / self.total as f64
        }
    }
}

/// Statistics plus derived success rate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    #[serde(flatten)]
    pub counts: BatchStatistics,
    pub success_rate: f64,
}

/// Everything persisted for one batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchState {
    pub batch_id: String,
    pub created_at: DateTime<Utc>,
    pub files: BTreeMap<String, FileRecord>,
    pub statistics: BatchStatistics,
}

impl BatchState {
    fn new(batch_id: &str) -> Self {
        Self {
            batch_id: batch_id.to_string(),
            created_at: Utc::now(),
            files: BTreeMap::new(),
            statistics: BatchStatistics::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// Failed files with this many attempts are no longer offered for retry
    pub retry_cap: Option<u32>,
}

/// Owner of one batch's state and its file on disk
#[derive(Debug)]
pub struct BatchStateStore {
    state: BatchState,
    state_file: PathBuf,
    config: StoreConfig,
    next_sequence: u64,
}

impl BatchStateStore {
    /// Open (or create) the state for `batch_id` under `state_dir`
    pub fn open(state_dir: impl AsRef<Path>, batch_id: &str, config: StoreConfig) -> Result<Self> {
        let state_dir = state_dir.as_ref();
        std::fs::create_dir_all(state_dir)?;
        let state_file = state_file_path(state_dir, batch_id);

        let mut state = load_state(&state_file, batch_id);

        let mut recovered = 0;
        for record in state.files.values_mut() {
            if record.status == FileStatus::InProgress {
                record.status = FileStatus::Pending;
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!("Recovered {} interrupted file(s) in batch {}", recovered, batch_id);
        }

        let rebuilt = BatchStatistics::from_records(state.files.values());
        if rebuilt != state.statistics && recovered == 0 {
            warn!("Batch {} statistics were inconsistent, rebuilt from records", batch_id);
        }
        state.statistics = rebuilt;

        let next_sequence = state
            .files
            .values()
            .map(|r| r.sequence + 1)
            .max()
            .unwrap_or(0);

        info!(
            "Opened batch {} at {} ({} files)",
            batch_id,
            state_file.display(),
            state.statistics.total
        );

        Ok(Self {
            state,
            state_file,
            config,
            next_sequence,
        })
    }

    pub fn batch_id(&self) -> &str {
        &self.state.batch_id
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    pub fn state(&self) -> &BatchState {
        &self.state
    }

    /// Register a file as pending; already-known paths are left untouched
    pub fn register(&mut self, path: &Path) -> Result<()> {
        if self.insert_record(path) {
            self.persist()?;
        }
        Ok(())
    }

    /// Register many files with a single persist
    pub fn register_all<'a>(&mut self, paths: impl IntoIterator<Item = &'a Path>) -> Result<()> {
        let mut added = 0;
        for path in paths {
            if self.insert_record(path) {
                added += 1;
            }
        }
        if added > 0 {
            debug!("Registered {} new file(s)", added);
            self.persist()?;
        }
        Ok(())
    }

    fn insert_record(&mut self, path: &Path) -> bool {
        let key = path_key(path);
        if self.state.files.contains_key(&key) {
            return false;
        }

        self.state.files.insert(
            key,
            FileRecord {
                path: path.to_path_buf(),
                status: FileStatus::Pending,
                attempts: 0,
                last_error: None,
                output_path: None,
                started_at: None,
                completed_at: None,
                updated_at: None,
                sequence: self.next_sequence,
            },
        );
        self.next_sequence += 1;
        self.state.statistics.total += 1;
        self.state.statistics.pending += 1;
        true
    }

    /// Update a file's status, registering it first if unknown.
    ///
    /// On a persist failure the in-memory change is kept and the error returned.
    pub fn set_status(&mut self, path: &Path, status: FileStatus, metadata: StatusMetadata) -> Result<()> {
        self.insert_record(path);
        let key = path_key(path);
        let now = Utc::now();

        let Some(record) = self.state.files.get_mut(&key) else {
            return Err(BatchError::Worker(format!("no record for {}", path.display())));
        };
        let previous = record.status;

        record.status = status;
        record.updated_at = Some(now);

        match status {
            FileStatus::InProgress => {
                if record.started_at.is_none() {
                    record.started_at = Some(now);
                }
            }
            FileStatus::Success | FileStatus::Skipped => record.completed_at = Some(now),
            FileStatus::Failed => {
                record.completed_at = Some(now);
                record.attempts += 1;
            }
            FileStatus::Pending => {}
        }

        if let Some(error) = metadata.error {
            record.last_error = Some(error);
        }
        if let Some(output) = metadata.output_path {
            record.output_path = Some(output);
        }

        self.state.statistics.transfer(previous, status);
        debug!("File status updated: {} {} -> {}", path.display(), previous, status);

        self.persist()
    }

    /// Files still to process, in registration order
    pub fn pending_files(&self) -> Vec<PathBuf> {
        let mut eligible: Vec<&FileRecord> = self
            .state
            .files
            .values()
            .filter(|r| match r.status {
                FileStatus::Pending => true,
                FileStatus::Failed => self.config.retry_cap.map_or(true, |cap| r.attempts < cap),
                FileStatus::InProgress | FileStatus::Success | FileStatus::Skipped => false,
            })
            .collect();
        eligible.sort_by_key(|r| r.sequence);
        eligible.into_iter().map(|r| r.path.clone()).collect()
    }

    pub fn statistics(&self) -> BatchStatistics {
        self.state.statistics
    }

    pub fn statistics_snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            counts: self.state.statistics,
            success_rate: self.state.statistics.success_rate(),
        }
    }

    pub fn record(&self, path: &Path) -> Option<&FileRecord> {
        self.state.files.get(&path_key(path))
    }

    /// All records in registration order
    pub fn records(&self) -> Vec<&FileRecord> {
        let mut records: Vec<&FileRecord> = self.state.files.values().collect();
        records.sort_by_key(|r| r.sequence);
        records
    }

    /// Write the state atomically
    pub fn persist(&self) -> Result<()> {
        write_atomically(&self.state_file, &self.state).map_err(|source| {
            error!("Failed to save state to {}: {}", self.state_file.display(), source);
            BatchError::StatePersistence {
                path: self.state_file.clone(),
                source,
            }
        })
    }

    /// Remove the state file
    pub fn cleanup(&self) -> Result<()> {
        remove_state_file(&self.state_file)?;
        info!("Cleaned up batch state: {}", self.state.batch_id);
        Ok(())
    }
}

/// Path of the state file for `batch_id`
pub fn state_file_path(state_dir: &Path, batch_id: &str) -> PathBuf {
    state_dir.join(format!("{}.json", batch_id))
}

/// Read a persisted batch without taking ownership of it
pub fn read_state(state_file: &Path) -> Result<BatchState> {
    let data = std::fs::read(state_file)?;
    Ok(serde_json::from_slice(&data)?)
}

/// Remove a persisted batch; a missing file is not an error
pub fn remove_state_file(state_file: &Path) -> Result<()> {
    match std::fs::remove_file(state_file) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Batch ids with a state file under `state_dir`, sorted
pub fn list_batches(state_dir: &Path) -> Result<Vec<String>> {
    if !state_dir.exists() {
        return Ok(Vec::new());
    }

    let mut ids = Vec::new();
    for entry in std::fs::read_dir(state_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            ids.push(stem.to_string());
        }
    }
    ids.sort();
    Ok(ids)
}

fn load_state(state_file: &Path, batch_id: &str) -> BatchState {
    if !state_file.exists() {
        return BatchState::new(batch_id);
    }

    match read_state(state_file) {
        Ok(state) => state,
        Err(e) => {
            error!("Failed to load state from {}: {}. Starting fresh.", state_file.display(), e);
            BatchState::new(batch_id)
        }
    }
}

fn write_atomically(target: &Path, state: &BatchState) -> std::io::Result<()> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let data = serde_json::to_vec_pretty(state)?;

    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(&data)?;
    file.as_file().sync_all()?;
    file.persist(target).map_err(|e| e.error)?;
    Ok(())
}

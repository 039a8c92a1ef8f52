use anyhow::{Context, Result};
use batch_transcriber::{
    state::{list_batches, read_state, remove_state_file, state_file_path, BatchState, FileRecord, FileStatus},
    DEFAULT_STATE_DIR,
};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use std::path::{Path, PathBuf};

/// Inspect batch state files as JSON
#[derive(Parser)]
#[command(name = "batch-state")]
#[command(about = "Inspect batch-transcriber state files")]
struct Cli {
    /// Directory holding batch state files
    #[arg(long, default_value = DEFAULT_STATE_DIR)]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List known batches with their statistics
    List,

    /// Print file records of a batch
    Show {
        batch_id: String,

        /// Only records with this status
        #[arg(long, value_enum)]
        status: Option<StatusFilter>,
    },

    /// Print statistics of a batch
    Stats { batch_id: String },

    /// Delete the state file of a batch
    Remove { batch_id: String },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
enum StatusFilter {
    Pending,
    InProgress,
    Success,
    Failed,
    Skipped,
}

impl From<StatusFilter> for FileStatus {
    fn from(filter: StatusFilter) -> Self {
        match filter {
            StatusFilter::Pending => FileStatus::Pending,
            StatusFilter::InProgress => FileStatus::InProgress,
            StatusFilter::Success => FileStatus::Success,
            StatusFilter::Failed => FileStatus::Failed,
            StatusFilter::Skipped => FileStatus::Skipped,
        }
    }
}

fn load(state_dir: &Path, batch_id: &str) -> Result<BatchState> {
    let file = state_file_path(state_dir, batch_id);
    read_state(&file).with_context(|| format!("Failed to read batch state {}", file.display()))
}

fn records(state: &BatchState, status: Option<FileStatus>) -> Vec<&FileRecord> {
    let mut records: Vec<&FileRecord> = state
        .files
        .values()
        .filter(|r| status.map_or(true, |s| r.status == s))
        .collect();
    records.sort_by_key(|r| r.sequence);
    records
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::List => {
            let mut batches = Vec::new();
            for id in list_batches(&cli.state_dir)? {
                match load(&cli.state_dir, &id) {
                    Ok(state) => batches.push(json!({
                        "batch_id": state.batch_id,
                        "created_at": state.created_at,
                        "statistics": state.statistics,
                        "success_rate": state.statistics.success_rate(),
                    })),
                    Err(e) => batches.push(json!({
                        "batch_id": id,
                        "error": format!("{:#}", e),
                    })),
                }
            }
            println!("{}", serde_json::to_string_pretty(&batches)?);
        }

        Commands::Show { batch_id, status } => {
            let state = load(&cli.state_dir, &batch_id)?;
            let records = records(&state, status.map(FileStatus::from));
            println!("{}", serde_json::to_string_pretty(&records)?);
        }

        Commands::Stats { batch_id } => {
            let state = load(&cli.state_dir, &batch_id)?;
            let stats = json!({
                "batch_id": state.batch_id,
                "statistics": state.statistics,
                "success_rate": state.statistics.success_rate(),
            });
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }

        Commands::Remove { batch_id } => {
            let file = state_file_path(&cli.state_dir, &batch_id);
            remove_state_file(&file)?;
            println!("Batch {} removed", batch_id);
        }
    }

    Ok(())
}

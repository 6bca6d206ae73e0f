//! Command-line interface definitions.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser, Clone)]
#[command(
    name = "buddy",
    version,
    about = "Queue commands for Stacks projects"
)]
pub struct Cli {
    /// Project directory holding `.env` and the database.
    #[arg(short, long, global = true, default_value = ".")]
    pub project: PathBuf,

    /// Log at debug level.
    #[arg(long, global = true)]
    pub verbose: bool,

    /// Queue connection (`database` or `memory`); falls back to `QUEUE_CONNECTION`.
    #[arg(long, global = true)]
    pub connection: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Process jobs until interrupted.
    #[command(name = "queue:work")]
    Work(WorkArgs),

    /// Delete all pending and reserved jobs.
    #[command(name = "queue:clear")]
    Clear(ClearArgs),

    /// Delete failed jobs permanently.
    #[command(name = "queue:flush")]
    Flush(FlushArgs),

    /// Move failed jobs back onto their queue.
    #[command(name = "queue:retry")]
    Retry(RetryArgs),
}

#[derive(Debug, Args, Clone, Default)]
pub struct WorkArgs {
    /// Queues to work, highest priority first.
    #[arg(long, value_delimiter = ',')]
    pub queue: Vec<String>,

    /// Number of concurrent workers.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Seconds to sleep when no job is available.
    #[arg(long)]
    pub sleep: Option<u64>,

    /// Default handler timeout in seconds.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Max jobs per minute on each queue.
    #[arg(long)]
    pub rate_limit: Option<u32>,
}

#[derive(Debug, Args, Clone, Default)]
pub struct ClearArgs {
    /// Only clear this queue.
    #[arg(long)]
    pub queue: Option<String>,

    /// Confirm the deletion.
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Args, Clone, Default)]
pub struct FlushArgs {
    /// Only flush failed jobs from this queue.
    #[arg(long, conflicts_with = "all")]
    pub queue: Option<String>,

    /// Flush failed jobs from every queue.
    #[arg(long)]
    pub all: bool,

    /// Confirm the deletion.
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Args, Clone, Default)]
pub struct RetryArgs {
    /// Failed job id to retry.
    #[arg(long, conflicts_with = "all")]
    pub id: Option<i64>,

    /// Retry every failed job.
    #[arg(long)]
    pub all: bool,
}

//! CLI error type.

use stacks_queue_core::QueueError;
use thiserror::Error;

/// Errors reported by `buddy` commands. Every variant exits with status 1.
#[derive(Error, Debug)]
pub enum CommandError {
    /// A destructive command ran without `--force`.
    #[error("{command} deletes {what}; re-run with --force to confirm")]
    ForceRequired {
        command: &'static str,
        what: &'static str,
    },

    /// Arguments are missing or contradictory.
    #[error("{0}")]
    Usage(String),

    #[error("No failed job with id {0}")]
    FailedJobNotFound(i64),

    #[error("No jobs are registered with this worker binary")]
    NoJobsRegistered,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

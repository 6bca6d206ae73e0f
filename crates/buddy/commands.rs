//! Queue commands.
//!
//! Each command runs against a [`Backend`] and returns the message to print,
//! so they can be exercised without spawning a process.

use std::future::Future;
use std::sync::Arc;

use stacks_queue_core::{
    current_timestamp, Backend, FailedJobId, JobRegistry, LeaderElection, SharedBackend,
    WorkerConfig, WorkerPool,
};

use crate::cli::Command;
use crate::error::CommandError;

/// Reject arguments a command would refuse, before any storage is opened.
pub fn check(command: &Command) -> Result<(), CommandError> {
    match command {
        Command::Work(_) => Ok(()),
        Command::Clear(args) => require_force("queue:clear", "all queued jobs", args.force),
        Command::Flush(args) => {
            flush_scope(args.queue.as_deref(), args.all)?;
            require_force("queue:flush", "failed jobs", args.force)
        }
        Command::Retry(args) => retry_target(args.id, args.all).map(|_| ()),
    }
}

fn require_force(command: &'static str, what: &'static str, force: bool) -> Result<(), CommandError> {
    if force {
        Ok(())
    } else {
        Err(CommandError::ForceRequired { command, what })
    }
}

/// `--all` is the explicit form of flushing every queue.
fn flush_scope(queue: Option<&str>, all: bool) -> Result<Option<&str>, CommandError> {
    match (queue, all) {
        (Some(_), true) => Err(CommandError::Usage(
            "queue:flush takes either --queue or --all, not both".to_string(),
        )),
        (queue, _) => Ok(queue),
    }
}

/// Which failed jobs `queue:retry` targets: one id, or `None` for all.
fn retry_target(id: Option<i64>, all: bool) -> Result<Option<FailedJobId>, CommandError> {
    match (id, all) {
        (Some(id), false) => Ok(Some(FailedJobId(id))),
        (None, true) => Ok(None),
        (Some(_), true) => Err(CommandError::Usage(
            "queue:retry takes either --id or --all, not both".to_string(),
        )),
        (None, false) => Err(CommandError::Usage(
            "queue:retry needs --id <ID> or --all".to_string(),
        )),
    }
}

/// `queue:clear`: delete pending and reserved jobs.
pub async fn clear(
    backend: &dyn Backend,
    queue: Option<&str>,
    force: bool,
) -> Result<String, CommandError> {
    require_force("queue:clear", "all queued jobs", force)?;

    let cleared = backend.clear(queue).await?;
    tracing::info!(queue = queue.unwrap_or("*"), cleared, "Cleared jobs");
    Ok(format!("Cleared {} job(s)", cleared))
}

/// `queue:flush`: delete failed jobs for good.
pub async fn flush(
    backend: &dyn Backend,
    queue: Option<&str>,
    all: bool,
    force: bool,
) -> Result<String, CommandError> {
    let queue = flush_scope(queue, all)?;
    require_force("queue:flush", "failed jobs", force)?;

    let flushed = backend.flush(queue).await?;
    tracing::info!(queue = queue.unwrap_or("*"), flushed, "Flushed failed jobs");
    Ok(format!("Flushed {} failed job(s)", flushed))
}

/// `queue:retry`: requeue one failed job by id, or all of them.
pub async fn retry(
    backend: &dyn Backend,
    id: Option<i64>,
    all: bool,
) -> Result<String, CommandError> {
    let ids = match retry_target(id, all)? {
        Some(id) => vec![id],
        None => backend.failed_ids(None).await?,
    };

    let now = current_timestamp();
    let mut retried = 0usize;
    for failed_id in ids {
        match backend.requeue(failed_id, now).await? {
            Some(job_id) => {
                retried += 1;
                tracing::info!(failed_id = %failed_id, job_id = %job_id, "Requeued failed job");
            }
            // a single id must exist; with --all it was removed concurrently
            None if !all => return Err(CommandError::FailedJobNotFound(failed_id.0)),
            None => {}
        }
    }

    Ok(format!("Retried {} failed job(s)", retried))
}

/// `queue:work`: run a worker pool until `shutdown` resolves.
pub async fn work<S>(
    backend: SharedBackend,
    elector: Arc<dyn LeaderElection>,
    registry: JobRegistry,
    config: WorkerConfig,
    shutdown: S,
) -> Result<String, CommandError>
where
    S: Future<Output = ()> + Send,
{
    if registry.names().is_empty() {
        return Err(CommandError::NoJobsRegistered);
    }

    tracing::info!(jobs = %registry.names().join(","), "Starting queue worker");

    let pool = WorkerPool::builder()
        .shared_backend(backend)
        .registry(registry)
        .config(config)
        .elector(elector)
        .build()?;

    pool.run_until(shutdown).await?;
    Ok("Worker stopped".to_string())
}

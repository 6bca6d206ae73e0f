//! Backend abstraction for job queue storage.
//!
//! A backend exclusively owns job and failed-job rows. Workers only hold a
//! lease on a claimed job: `complete`, `release` and `fail` succeed only while
//! the row still carries the `reserved_at`/`attempts` pair the worker claimed
//! it with, so a reclaimed reservation cannot be finished twice.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::job::{FailedJob, FailedJobId, Job, JobId, NewJob};

/// Backend trait for job queue storage operations.
///
/// Implementations must be thread-safe (Send + Sync) and must make `claim`,
/// `fail` and `requeue` atomic with respect to concurrent callers.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Name written to `failed_jobs.connection`.
    fn connection_name(&self) -> &str;

    // ========== Active Jobs ==========

    /// Insert a pending job with zero attempts.
    async fn push(&self, job: NewJob) -> Result<JobId>;

    /// Claim the oldest available, unreserved job on `queue`.
    ///
    /// Sets `reserved_at = now` and increments `attempts`. Jobs whose overlap
    /// key matches a currently reserved job are skipped. Returns `None` if no
    /// job is eligible.
    async fn claim(&self, queue: &str, now: i64) -> Result<Option<Job>>;

    /// Delete a finished job. Returns `false` if the lease was lost.
    async fn complete(&self, job: &Job) -> Result<bool>;

    /// Return a reserved job to pending, available again at `available_at`.
    /// Returns `false` if the lease was lost.
    async fn release(&self, job: &Job, available_at: i64) -> Result<bool>;

    /// Convert a reserved job into a failed job in one step.
    ///
    /// Returns `None` (and changes nothing) if the lease was lost.
    async fn fail(&self, job: &Job, exception: &str, failed_at: i64)
        -> Result<Option<FailedJobId>>;

    /// Delete all pending and reserved jobs, optionally only on one queue.
    async fn clear(&self, queue: Option<&str>) -> Result<u64>;

    /// Reserved jobs whose reservation started at or before `reserved_before`.
    async fn expired_reservations(&self, reserved_before: i64, limit: usize) -> Result<Vec<Job>>;

    /// Look up an active job.
    async fn job(&self, id: JobId) -> Result<Option<Job>>;

    /// Number of active jobs, optionally on one queue.
    async fn len(&self, queue: Option<&str>) -> Result<usize>;

    // ========== Failed Jobs ==========

    /// Move a failed job back to the active queue with zero attempts.
    ///
    /// Returns `None` (and changes nothing) if no failed job has this id.
    async fn requeue(&self, id: FailedJobId, now: i64) -> Result<Option<JobId>>;

    /// Delete failed jobs, optionally only those from one queue.
    async fn flush(&self, queue: Option<&str>) -> Result<u64>;

    /// Look up a failed job.
    async fn failed_job(&self, id: FailedJobId) -> Result<Option<FailedJob>>;

    /// Ids of failed jobs in the order they failed.
    async fn failed_ids(&self, queue: Option<&str>) -> Result<Vec<FailedJobId>>;

    /// Failed jobs, newest first.
    async fn list_failed(&self, limit: usize, offset: usize) -> Result<Vec<FailedJob>>;

    /// Number of failed jobs, optionally from one queue.
    async fn failed_len(&self, queue: Option<&str>) -> Result<usize>;
}

/// A type-erased backend that can be shared across threads.
pub type DynBackend = Arc<dyn Backend>;

/// Wrapper around Arc<dyn Backend> for convenience.
#[derive(Clone)]
pub struct SharedBackend {
    inner: DynBackend,
}

impl SharedBackend {
    /// Create a new SharedBackend from any Backend implementation.
    pub fn new<B: Backend + 'static>(backend: B) -> Self {
        Self {
            inner: Arc::new(backend),
        }
    }

    /// Wrap an already shared backend.
    pub fn from_arc(inner: DynBackend) -> Self {
        Self { inner }
    }

    /// Get a reference to the inner backend.
    pub fn inner(&self) -> &DynBackend {
        &self.inner
    }
}

#[async_trait]
impl Backend for SharedBackend {
    fn connection_name(&self) -> &str {
        self.inner.connection_name()
    }

    async fn push(&self, job: NewJob) -> Result<JobId> {
        self.inner.push(job).await
    }

    async fn claim(&self, queue: &str, now: i64) -> Result<Option<Job>> {
        self.inner.claim(queue, now).await
    }

    async fn complete(&self, job: &Job) -> Result<bool> {
        self.inner.complete(job).await
    }

    async fn release(&self, job: &Job, available_at: i64) -> Result<bool> {
        self.inner.release(job, available_at).await
    }

    async fn fail(
        &self,
        job: &Job,
        exception: &str,
        failed_at: i64,
    ) -> Result<Option<FailedJobId>> {
        self.inner.fail(job, exception, failed_at).await
    }

    async fn clear(&self, queue: Option<&str>) -> Result<u64> {
        self.inner.clear(queue).await
    }

    async fn expired_reservations(&self, reserved_before: i64, limit: usize) -> Result<Vec<Job>> {
        self.inner.expired_reservations(reserved_before, limit).await
    }

    async fn job(&self, id: JobId) -> Result<Option<Job>> {
        self.inner.job(id).await
    }

    async fn len(&self, queue: Option<&str>) -> Result<usize> {
        self.inner.len(queue).await
    }

    async fn requeue(&self, id: FailedJobId, now: i64) -> Result<Option<JobId>> {
        self.inner.requeue(id, now).await
    }

    async fn flush(&self, queue: Option<&str>) -> Result<u64> {
        self.inner.flush(queue).await
    }

    async fn failed_job(&self, id: FailedJobId) -> Result<Option<FailedJob>> {
        self.inner.failed_job(id).await
    }

    async fn failed_ids(&self, queue: Option<&str>) -> Result<Vec<FailedJobId>> {
        self.inner.failed_ids(queue).await
    }

    async fn list_failed(&self, limit: usize, offset: usize) -> Result<Vec<FailedJob>> {
        self.inner.list_failed(limit, offset).await
    }

    async fn failed_len(&self, queue: Option<&str>) -> Result<usize> {
        self.inner.failed_len(queue).await
    }
}

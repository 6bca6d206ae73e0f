//! Client for dispatching jobs.

use std::time::Duration;

use crate::backend::{Backend, SharedBackend};
use crate::error::Result;
use crate::job::{current_timestamp, JobId, NewJob, Payload};
use crate::registry::Queueable;

/// Client for dispatching jobs onto the queue.
#[derive(Clone)]
pub struct Client<B: Backend + Clone = SharedBackend> {
    backend: B,
}

impl Client<SharedBackend> {
    /// Create a new client with a shared backend.
    pub fn new(backend: impl Backend + 'static) -> Self {
        Self {
            backend: SharedBackend::new(backend),
        }
    }
}

impl<B: Backend + Clone> Client<B> {
    /// Create a new client with a specific backend.
    pub fn with_backend(backend: B) -> Self {
        Self { backend }
    }

    /// Dispatch a job onto its default queue, available immediately.
    pub async fn dispatch<J: Queueable>(&self, job: &J) -> Result<JobId> {
        self.push(job, J::queue(), current_timestamp()).await
    }

    /// Dispatch a job onto a specific queue.
    pub async fn dispatch_on<J: Queueable>(&self, queue: &str, job: &J) -> Result<JobId> {
        self.push(job, queue, current_timestamp()).await
    }

    /// Dispatch a job that becomes available after `delay`.
    pub async fn dispatch_later<J: Queueable>(&self, job: &J, delay: Duration) -> Result<JobId> {
        let delay = i64::try_from(delay.as_secs()).unwrap_or(i64::MAX);
        self.push(job, J::queue(), current_timestamp().saturating_add(delay))
            .await
    }

    async fn push<J: Queueable>(&self, job: &J, queue: &str, available_at: i64) -> Result<JobId> {
        let mut payload = Payload::new(J::NAME, serde_json::to_value(job)?, &J::policy())
            .with_timeout(J::timeout());
        if let Some(key) = job.overlap_key() {
            payload = payload.with_overlap_key(key);
        }

        let new_job = NewJob::new(payload.to_json()?)
            .on_queue(queue)
            .available_at(available_at)
            .overlap_key(payload.overlap_identity());
        let job_id = self.backend.push(new_job).await?;

        tracing::debug!(job_id = %job_id, job = J::NAME, queue = %queue, "Job dispatched");
        Ok(job_id)
    }

    /// Number of active jobs, optionally on one queue.
    pub async fn len(&self, queue: Option<&str>) -> Result<usize> {
        self.backend.len(queue).await
    }

    /// Whether there are no active jobs.
    pub async fn is_empty(&self, queue: Option<&str>) -> Result<bool> {
        Ok(self.len(queue).await? == 0)
    }

    /// Number of failed jobs, optionally from one queue.
    pub async fn failed_len(&self, queue: Option<&str>) -> Result<usize> {
        self.backend.failed_len(queue).await
    }

    /// Get a reference to the backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }
}

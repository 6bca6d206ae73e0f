//! In-memory backend.
//!
//! Every operation runs under a single mutex, which gives claim, fail and
//! requeue the same atomicity a transactional store provides. Suitable for
//! tests and single-process development; nothing survives a restart.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::backend::Backend;
use crate::error::Result;
use crate::job::{current_timestamp, FailedJob, FailedJobId, Job, JobId, NewJob, Payload};

#[derive(Default)]
struct State {
    next_job_id: i64,
    next_failed_id: i64,
    jobs: BTreeMap<i64, Job>,
    failed: BTreeMap<i64, FailedJob>,
}

impl State {
    fn insert_job(&mut self, job: NewJob, now: i64) -> JobId {
        self.next_job_id += 1;
        let id = self.next_job_id;
        self.jobs.insert(
            id,
            Job {
                id: JobId(id),
                queue: job.queue,
                payload: job.payload,
                attempts: 0,
                reserved_at: None,
                available_at: job.available_at,
                overlap_key: job.overlap_key,
                created_at: now,
                updated_at: now,
            },
        );
        JobId(id)
    }

    /// Whether `job` still matches the stored reservation.
    fn holds_lease(&self, job: &Job) -> bool {
        match self.jobs.get(&job.id.0) {
            Some(stored) => {
                job.reserved_at.is_some()
                    && stored.reserved_at == job.reserved_at
                    && stored.attempts == job.attempts
            }
            None => false,
        }
    }
}

/// In-memory job queue storage.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

fn on_queue(queue: Option<&str>, candidate: &str) -> bool {
    queue.map_or(true, |q| q == candidate)
}

#[async_trait]
impl Backend for MemoryBackend {
    fn connection_name(&self) -> &str {
        "memory"
    }

    async fn push(&self, job: NewJob) -> Result<JobId> {
        let now = current_timestamp();
        let mut state = self.state.lock().await;
        Ok(state.insert_job(job, now))
    }

    async fn claim(&self, queue: &str, now: i64) -> Result<Option<Job>> {
        let mut state = self.state.lock().await;

        let busy: HashSet<String> = state
            .jobs
            .values()
            .filter(|job| job.reserved_at.is_some())
            .filter_map(|job| job.overlap_key.clone())
            .collect();

        let candidate = state
            .jobs
            .values()
            .find(|job| {
                job.queue == queue
                    && job.reserved_at.is_none()
                    && job.available_at <= now
                    && job
                        .overlap_key
                        .as_ref()
                        .map_or(true, |key| !busy.contains(key))
            })
            .map(|job| job.id.0);

        let Some(id) = candidate else {
            return Ok(None);
        };

        let job = state
            .jobs
            .get_mut(&id)
            .map(|job| {
                job.reserved_at = Some(now);
                job.attempts += 1;
                job.updated_at = now;
                job.clone()
            });
        Ok(job)
    }

    async fn complete(&self, job: &Job) -> Result<bool> {
        let mut state = self.state.lock().await;
        if !state.holds_lease(job) {
            return Ok(false);
        }
        state.jobs.remove(&job.id.0);
        Ok(true)
    }

    async fn release(&self, job: &Job, available_at: i64) -> Result<bool> {
        let mut state = self.state.lock().await;
        if !state.holds_lease(job) {
            return Ok(false);
        }
        let now = current_timestamp();
        if let Some(stored) = state.jobs.get_mut(&job.id.0) {
            stored.reserved_at = None;
            stored.available_at = available_at;
            stored.updated_at = now;
        }
        Ok(true)
    }

    async fn fail(
        &self,
        job: &Job,
        exception: &str,
        failed_at: i64,
    ) -> Result<Option<FailedJobId>> {
        let mut state = self.state.lock().await;
        if !state.holds_lease(job) {
            return Ok(None);
        }
        let Some(removed) = state.jobs.remove(&job.id.0) else {
            return Ok(None);
        };

        state.next_failed_id += 1;
        let id = state.next_failed_id;
        state.failed.insert(
            id,
            FailedJob {
                id: FailedJobId(id),
                connection: self.connection_name().to_string(),
                queue: removed.queue,
                payload: removed.payload,
                exception: exception.to_string(),
                failed_at,
                created_at: failed_at,
                updated_at: failed_at,
            },
        );
        Ok(Some(FailedJobId(id)))
    }

    async fn clear(&self, queue: Option<&str>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.jobs.len();
        state.jobs.retain(|_, job| !on_queue(queue, &job.queue));
        Ok((before - state.jobs.len()) as u64)
    }

    async fn expired_reservations(&self, reserved_before: i64, limit: usize) -> Result<Vec<Job>> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| job.reserved_at.is_some_and(|at| at <= reserved_before))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn job(&self, id: JobId) -> Result<Option<Job>> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&id.0).cloned())
    }

    async fn len(&self, queue: Option<&str>) -> Result<usize> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| on_queue(queue, &job.queue))
            .count())
    }

    async fn requeue(&self, id: FailedJobId, now: i64) -> Result<Option<JobId>> {
        let mut state = self.state.lock().await;
        let Some(failed) = state.failed.remove(&id.0) else {
            return Ok(None);
        };

        let overlap_key = Payload::from_json(&failed.payload)
            .ok()
            .and_then(|payload| payload.overlap_identity());

        let job = NewJob {
            queue: failed.queue,
            payload: failed.payload,
            available_at: now,
            overlap_key,
        };
        Ok(Some(state.insert_job(job, now)))
    }

    async fn flush(&self, queue: Option<&str>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.failed.len();
        state.failed.retain(|_, failed| !on_queue(queue, &failed.queue));
        Ok((before - state.failed.len()) as u64)
    }

    async fn failed_job(&self, id: FailedJobId) -> Result<Option<FailedJob>> {
        let state = self.state.lock().await;
        Ok(state.failed.get(&id.0).cloned())
    }

    async fn failed_ids(&self, queue: Option<&str>) -> Result<Vec<FailedJobId>> {
        let state = self.state.lock().await;
        Ok(state
            .failed
            .values()
            .filter(|failed| on_queue(queue, &failed.queue))
            .map(|failed| failed.id)
            .collect())
    }

    async fn list_failed(&self, limit: usize, offset: usize) -> Result<Vec<FailedJob>> {
        let state = self.state.lock().await;
        Ok(state
            .failed
            .values()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn failed_len(&self, queue: Option<&str>) -> Result<usize> {
        let state = self.state.lock().await;
        Ok(state
            .failed
            .values()
            .filter(|failed| on_queue(queue, &failed.queue))
            .count())
    }
}

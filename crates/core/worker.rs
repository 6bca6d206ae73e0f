//! Worker that claims jobs and drives them through their lifecycle.
//!
//! A claimed job ends in exactly one of three ways: the handler succeeds and
//! the row is deleted, the handler fails with attempts to spare and the job
//! is released with a backoff delay, or the attempts are spent and the job is
//! converted into a failed job.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::backend::Backend;
use crate::config::WorkerConfig;
use crate::error::Result;
use crate::job::{current_timestamp, FailedJobId, Job};
use crate::rate_limit::{RateDecision, RateLimiter};
use crate::registry::JobRegistry;

/// Result type for job handlers.
pub type JobResult = std::result::Result<(), JobError>;

/// Error returned from job handlers.
#[derive(Debug)]
pub struct JobError {
    /// Error message, stored as the failed job's exception.
    pub message: String,
    /// Whether the job should be retried.
    pub retryable: bool,
}

impl JobError {
    /// Create a new retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a new non-retryable error (job fails immediately).
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl<E: std::error::Error> From<E> for JobError {
    fn from(err: E) -> Self {
        Self::retryable(err.to_string())
    }
}

/// What happened to a claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Handler succeeded; the job was deleted.
    Completed,
    /// Handler failed with attempts left; the job is pending again.
    Released { available_at: i64 },
    /// Attempts exhausted or fatal error; the job is now a failed job.
    Failed { failed_id: FailedJobId },
    /// The reservation was reclaimed before the worker finished.
    LeaseLost,
}

/// Flags shared between a pool and its workers.
#[derive(Clone)]
pub(crate) struct Signals {
    pub(crate) running: Arc<AtomicBool>,
    pub(crate) draining: Arc<AtomicBool>,
    pub(crate) in_progress: Arc<AtomicUsize>,
    pub(crate) drain_notify: Arc<Notify>,
}

impl Default for Signals {
    fn default() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
            draining: Arc::new(AtomicBool::new(false)),
            in_progress: Arc::new(AtomicUsize::new(0)),
            drain_notify: Arc::new(Notify::new()),
        }
    }
}

/// Individual worker that processes jobs.
pub struct Worker<B: Backend + Clone + 'static> {
    id: usize,
    backend: B,
    registry: Arc<JobRegistry>,
    config: Arc<WorkerConfig>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    signals: Signals,
}

impl<B: Backend + Clone + 'static> Worker<B> {
    /// Create a standalone worker.
    pub fn new(id: usize, backend: B, registry: Arc<JobRegistry>, config: Arc<WorkerConfig>) -> Self {
        Self {
            id,
            backend,
            registry,
            config,
            rate_limiter: None,
            signals: Signals::default(),
        }
    }

    /// Throttle handler execution per queue.
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub(crate) fn with_signals(mut self, signals: Signals) -> Self {
        self.signals = signals;
        self
    }

    /// Run until the pool stops or starts draining.
    pub async fn run(&self) -> Result<()> {
        tracing::debug!(worker_id = self.id, "Worker started");

        while self.signals.running.load(Ordering::SeqCst) {
            if self.signals.draining.load(Ordering::SeqCst) {
                tracing::debug!(worker_id = self.id, "Worker draining, stopping fetch");
                break;
            }

            match self.process_next(current_timestamp()).await {
                Ok(Some(_)) => {}
                Ok(None) => tokio::time::sleep(self.config.poll_interval).await,
                Err(e) => {
                    // storage faults are not retried here; back off and poll again
                    tracing::error!(worker_id = self.id, error = %e, "Worker error");
                    tokio::time::sleep(self.config.error_backoff).await;
                }
            }
        }

        tracing::debug!(worker_id = self.id, "Worker stopped");
        Ok(())
    }

    /// Claim and process at most one job.
    ///
    /// Queues are tried in configured order, passing over rate-limited ones.
    /// Returns `None` if nothing was available. Handler errors become an
    /// [`Outcome`]; only storage errors are returned as `Err`.
    ///
    /// `now` is the claim time. Releases and failures are stamped with `now`
    /// plus the time spent processing, rounded up to whole seconds.
    pub async fn process_next(&self, now: i64) -> Result<Option<Outcome>> {
        let started = Instant::now();
        let Some(job) = self.claim_next(now).await? else {
            return Ok(None);
        };

        self.signals.in_progress.fetch_add(1, Ordering::SeqCst);
        let outcome = self.process(job, now, started).await;
        self.signals.in_progress.fetch_sub(1, Ordering::SeqCst);
        self.signals.drain_notify.notify_one();

        outcome.map(Some)
    }

    async fn claim_next(&self, now: i64) -> Result<Option<Job>> {
        for queue in &self.config.queues {
            if !self.admits(queue).await? {
                continue;
            }
            if let Some(job) = self.backend.claim(queue, now).await? {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    async fn process(&self, job: Job, claimed_at: i64, started: Instant) -> Result<Outcome> {
        let payload = match job.decode_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(job_id = %job.id, queue = %job.queue, error = %e, "Failed to parse job payload");
                let now = finished_at(claimed_at, started);
                return self.fail(&job, &format!("invalid payload: {e}"), now).await;
            }
        };

        tracing::debug!(
            worker_id = self.id,
            job_id = %job.id,
            job = %payload.job,
            queue = %job.queue,
            attempts = job.attempts,
            "Processing job"
        );

        let timeout = payload.timeout().unwrap_or(self.config.job_timeout);
        let result = match self.registry.execute(&payload.job, payload.data.clone()) {
            None => Err(JobError::fatal(format!(
                "no handler registered for job `{}`",
                payload.job
            ))),
            Some(handler) => match tokio::time::timeout(timeout, handler).await {
                Ok(result) => result,
                Err(_) => Err(JobError::retryable(format!(
                    "job `{}` timed out after {}s",
                    payload.job,
                    timeout.as_secs()
                ))),
            },
        };

        let err = match result {
            Ok(()) => {
                if !self.backend.complete(&job).await? {
                    return Ok(self.lease_lost(&job));
                }
                tracing::debug!(worker_id = self.id, job_id = %job.id, "Job completed successfully");
                return Ok(Outcome::Completed);
            }
            Err(err) => err,
        };

        let now = finished_at(claimed_at, started);
        if err.retryable && job.attempts < payload.max_tries() {
            let delay = payload.backoff.delay_for(job.attempts);
            let available_at = now.saturating_add(whole_seconds(delay));

            if !self.backend.release(&job, available_at).await? {
                return Ok(self.lease_lost(&job));
            }

            tracing::warn!(
                worker_id = self.id,
                job_id = %job.id,
                queue = %job.queue,
                attempts = job.attempts,
                tries = payload.max_tries(),
                available_at = available_at,
                error = %err,
                "Job failed, released for retry"
            );
            Ok(Outcome::Released { available_at })
        } else {
            self.fail(&job, &err.message, now).await
        }
    }

    async fn fail(&self, job: &Job, exception: &str, now: i64) -> Result<Outcome> {
        match self.backend.fail(job, exception, now).await? {
            Some(failed_id) => {
                tracing::warn!(
                    worker_id = self.id,
                    job_id = %job.id,
                    failed_id = %failed_id,
                    queue = %job.queue,
                    attempts = job.attempts,
                    error = %exception,
                    "Job moved to failed jobs"
                );
                Ok(Outcome::Failed { failed_id })
            }
            None => Ok(self.lease_lost(job)),
        }
    }

    /// Ask the rate limiter for one slot on `queue`.
    async fn admits(&self, queue: &str) -> Result<bool> {
        let Some(limiter) = &self.rate_limiter else {
            return Ok(true);
        };

        match limiter.hit(queue).await? {
            RateDecision::Allowed => Ok(true),
            RateDecision::Limited { retry_after } => {
                tracing::debug!(
                    worker_id = self.id,
                    queue = %queue,
                    retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
                    "Queue rate limited"
                );
                Ok(false)
            }
        }
    }

    fn lease_lost(&self, job: &Job) -> Outcome {
        tracing::warn!(
            worker_id = self.id,
            job_id = %job.id,
            queue = %job.queue,
            "Reservation expired before the job finished"
        );
        Outcome::LeaseLost
    }
}

/// Claim time advanced by the time spent on the job.
fn finished_at(claimed_at: i64, started: Instant) -> i64 {
    claimed_at.saturating_add(whole_seconds(started.elapsed()))
}

/// Round a delay up to whole seconds.
fn whole_seconds(delay: Duration) -> i64 {
    let secs = delay.as_secs() + u64::from(delay.subsec_nanos() > 0);
    i64::try_from(secs).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::Backoff;
    use crate::job::{JobId, NewJob, Payload, RetryPolicy};
    use crate::memory::MemoryBackend;
    use crate::rate_limit::{GovernorRateLimiter, RateLimit};
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn registry_with_failing(calls: Arc<AtomicU32>, message: &'static str) -> JobRegistry {
        let mut registry = JobRegistry::new();
        registry.register_fn("send-email", move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(JobError::retryable(message)) }
        });
        registry.register_fn("noop", |_| async { Ok(()) });
        registry.register_fn("fatal", |_| async { Err(JobError::fatal("bad input")) });
        registry.register_fn("sleepy", |_| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        });
        registry
    }

    async fn dispatch(backend: &MemoryBackend, job: &str, policy: RetryPolicy) -> JobId {
        let payload = Payload::new(job, json!({"task": job}), &policy);
        backend
            .push(NewJob::new(payload.to_json().unwrap()).available_at(0))
            .await
            .unwrap()
    }

    fn worker(backend: &MemoryBackend, registry: JobRegistry) -> Worker<MemoryBackend> {
        Worker::new(0, backend.clone(), Arc::new(registry), Arc::new(WorkerConfig::default()))
    }

    #[test]
    fn test_job_error_constructors() {
        let err = JobError::retryable("later");
        assert!(err.retryable);
        assert_eq!(err.to_string(), "later");
        assert!(!JobError::fatal("never").retryable);

        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err: JobError = io.into();
        assert!(err.retryable);
        assert_eq!(err.message, "disk full");
    }

    #[test]
    fn test_whole_seconds_rounds_up() {
        assert_eq!(whole_seconds(Duration::ZERO), 0);
        assert_eq!(whole_seconds(Duration::from_secs(3)), 3);
        assert_eq!(whole_seconds(Duration::from_millis(1500)), 2);
    }

    #[tokio::test]
    async fn test_empty_queue_returns_none() {
        let backend = MemoryBackend::new();
        let worker = worker(&backend, JobRegistry::new());
        assert_eq!(worker.process_next(100).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_success_deletes_job() {
        let backend = MemoryBackend::new();
        dispatch(&backend, "noop", RetryPolicy::default()).await;
        let worker = worker(&backend, registry_with_failing(Arc::default(), "x"));

        assert_eq!(worker.process_next(100).await.unwrap(), Some(Outcome::Completed));
        assert_eq!(backend.len(None).await.unwrap(), 0);
        assert_eq!(backend.failed_len(None).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_smtp_down_scenario() {
        let backend = MemoryBackend::new();
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy {
            tries: 2,
            ..Default::default()
        };
        let id = dispatch(&backend, "send-email", policy).await;
        let worker = worker(&backend, registry_with_failing(calls.clone(), "smtp down"));

        // attempt 1: released with a future available_at
        let outcome = worker.process_next(100).await.unwrap().unwrap();
        assert_eq!(outcome, Outcome::Released { available_at: 103 });
        let job = backend.job(id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert!(job.reserved_at.is_none());
        assert_eq!(job.available_at, 103);

        // not yet eligible
        assert_eq!(worker.process_next(101).await.unwrap(), None);

        // attempt 2: moved to failed jobs
        let outcome = worker.process_next(103).await.unwrap().unwrap();
        let Outcome::Failed { failed_id } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(backend.job(id).await.unwrap().is_none());
        let failed = backend.failed_job(failed_id).await.unwrap().unwrap();
        assert!(failed.exception.contains("smtp down"));
        assert_eq!(failed.queue, "default");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_tries_fail_on_third_failure() {
        let backend = MemoryBackend::new();
        let calls = Arc::new(AtomicU32::new(0));
        dispatch(&backend, "send-email", RetryPolicy::default()).await;
        let worker = worker(&backend, registry_with_failing(calls.clone(), "nope"));

        let mut now = 0;
        for _ in 0..2 {
            let outcome = worker.process_next(now).await.unwrap().unwrap();
            assert!(matches!(outcome, Outcome::Released { .. }));
            assert_eq!(backend.failed_len(None).await.unwrap(), 0);
            now += 3;
        }

        let outcome = worker.process_next(now).await.unwrap().unwrap();
        assert!(matches!(outcome, Outcome::Failed { .. }));
        assert_eq!(backend.len(None).await.unwrap(), 0);
        assert_eq!(backend.failed_len(None).await.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_backoff_indexed_by_attempt() {
        let backend = MemoryBackend::new();
        let policy = RetryPolicy {
            tries: 4,
            backoff: Backoff::Sequence(vec![60, 120, 300]),
            without_overlapping: false,
        };
        dispatch(&backend, "send-email", policy).await;
        let worker = worker(&backend, registry_with_failing(Arc::default(), "x"));

        let mut now = 1000;
        for expected in [60, 120, 300] {
            let outcome = worker.process_next(now).await.unwrap().unwrap();
            assert_eq!(outcome, Outcome::Released { available_at: now + expected });
            now += expected;
        }
    }

    #[tokio::test]
    async fn test_fatal_error_skips_retries() {
        let backend = MemoryBackend::new();
        dispatch(&backend, "fatal", RetryPolicy::default()).await;
        let worker = worker(&backend, registry_with_failing(Arc::default(), "x"));

        let outcome = worker.process_next(0).await.unwrap().unwrap();
        assert!(matches!(outcome, Outcome::Failed { .. }));
        let failed = backend.list_failed(1, 0).await.unwrap();
        assert_eq!(failed[0].exception, "bad input");
    }

    #[tokio::test]
    async fn test_unknown_job_fails_immediately() {
        let backend = MemoryBackend::new();
        dispatch(&backend, "unregistered", RetryPolicy::default()).await;
        let worker = worker(&backend, JobRegistry::new());

        let outcome = worker.process_next(0).await.unwrap().unwrap();
        assert!(matches!(outcome, Outcome::Failed { .. }));
        let failed = backend.list_failed(1, 0).await.unwrap();
        assert!(failed[0].exception.contains("no handler registered for job `unregistered`"));
    }

    #[tokio::test]
    async fn test_invalid_payload_fails_immediately() {
        let backend = MemoryBackend::new();
        backend.push(NewJob::new("not json").available_at(0)).await.unwrap();
        let worker = worker(&backend, JobRegistry::new());

        let outcome = worker.process_next(0).await.unwrap().unwrap();
        assert!(matches!(outcome, Outcome::Failed { .. }));
        let failed = backend.list_failed(1, 0).await.unwrap();
        assert!(failed[0].exception.starts_with("invalid payload:"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_retryable_failure() {
        let backend = MemoryBackend::new();
        let payload = Payload::new("sleepy", json!({}), &RetryPolicy::default())
            .with_timeout(Some(Duration::from_secs(5)));
        backend
            .push(NewJob::new(payload.to_json().unwrap()).available_at(0))
            .await
            .unwrap();
        let worker = worker(&backend, registry_with_failing(Arc::default(), "x"));

        // backoff counts from the moment the timeout fired
        let outcome = worker.process_next(0).await.unwrap().unwrap();
        assert_eq!(outcome, Outcome::Released { available_at: 8 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_backoff_starts_after_it_finishes() {
        let backend = MemoryBackend::new();
        let mut registry = JobRegistry::new();
        registry.register_fn("slow", |_| async {
            tokio::time::sleep(Duration::from_millis(2100)).await;
            Err(JobError::retryable("still down"))
        });
        let policy = RetryPolicy {
            tries: 2,
            backoff: Backoff::Fixed(1),
            without_overlapping: false,
        };
        let id = dispatch(&backend, "slow", policy).await;
        let worker = worker(&backend, registry);

        let outcome = worker.process_next(100).await.unwrap().unwrap();
        assert_eq!(outcome, Outcome::Released { available_at: 104 });
        assert!(worker.process_next(103).await.unwrap().is_none());

        let outcome = worker.process_next(104).await.unwrap().unwrap();
        let Outcome::Failed { failed_id } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(backend.job(id).await.unwrap().is_none());
        let failed = backend.failed_job(failed_id).await.unwrap().unwrap();
        assert_eq!(failed.failed_at, 107);
    }

    #[tokio::test]
    async fn test_queues_tried_in_order() {
        let backend = MemoryBackend::new();
        let payload = Payload::new("noop", json!({}), &RetryPolicy::default()).to_json().unwrap();
        let low = backend
            .push(NewJob::new(payload.clone()).on_queue("low").available_at(0))
            .await
            .unwrap();
        let high = backend
            .push(NewJob::new(payload).on_queue("high").available_at(0))
            .await
            .unwrap();

        let config = WorkerConfig::builder().queues(["high", "low"]).build();
        let worker = Worker::new(
            0,
            backend.clone(),
            Arc::new(registry_with_failing(Arc::default(), "x")),
            Arc::new(config),
        );

        worker.process_next(0).await.unwrap();
        assert!(backend.job(high).await.unwrap().is_none());
        assert!(backend.job(low).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rate_limited_queue_is_not_claimed() {
        let backend = MemoryBackend::new();
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = JobRegistry::new();
        let counter = calls.clone();
        registry.register_fn("count", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        });
        let registry = Arc::new(registry);
        let policy = RetryPolicy::default();
        dispatch(&backend, "count", policy.clone()).await;
        let second = dispatch(&backend, "count", policy).await;

        let limiter: Arc<dyn RateLimiter> =
            Arc::new(GovernorRateLimiter::new(RateLimit::new(1, Duration::from_secs(60))).unwrap());
        let config = Arc::new(WorkerConfig::default());
        let first_worker = Worker::new(0, backend.clone(), registry.clone(), config.clone())
            .with_rate_limiter(limiter.clone());
        let second_worker =
            Worker::new(1, backend.clone(), registry, config).with_rate_limiter(limiter);

        assert_eq!(first_worker.process_next(100).await.unwrap(), Some(Outcome::Completed));
        assert_eq!(second_worker.process_next(100).await.unwrap(), None);
        assert_eq!(first_worker.process_next(100).await.unwrap(), None);

        // the limited job was never reserved, so it costs no attempt
        let job = backend.job(second).await.unwrap().unwrap();
        assert!(job.reserved_at.is_none());
        assert_eq!(job.attempts, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_admits_again_after_window() {
        let backend = MemoryBackend::new();
        for _ in 0..2 {
            dispatch(&backend, "noop", RetryPolicy::default()).await;
        }
        let limiter =
            GovernorRateLimiter::new(RateLimit::new(1, Duration::from_millis(300))).unwrap();
        let worker = worker(&backend, registry_with_failing(Arc::default(), "x"))
            .with_rate_limiter(Arc::new(limiter));

        assert_eq!(worker.process_next(0).await.unwrap(), Some(Outcome::Completed));
        assert_eq!(worker.process_next(0).await.unwrap(), None);

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(worker.process_next(0).await.unwrap(), Some(Outcome::Completed));
        assert_eq!(backend.len(None).await.unwrap(), 0);
    }
}

//! Configuration types for the worker pool.

use std::time::Duration;

use crate::error::{QueueError, Result};
use crate::job::DEFAULT_QUEUE;
use crate::rate_limit::RateLimit;

/// Configuration for the WorkerPool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queues to claim from, highest priority first.
    pub queues: Vec<String>,
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// Sleep between polls when every queue is empty.
    pub poll_interval: Duration,
    /// Sleep after a storage error before polling again.
    pub error_backoff: Duration,
    /// Handler timeout for jobs that do not set their own.
    pub job_timeout: Duration,
    /// Reservations older than this are reclaimed by the reaper.
    pub visibility_timeout: Duration,
    /// Whether to run the reaper.
    pub enable_reaper: bool,
    /// Interval for the reaper loop.
    pub reaper_interval: Duration,
    /// Max expired reservations reclaimed per reaper round.
    pub batch_size: usize,
    /// Graceful shutdown timeout.
    pub shutdown_timeout: Duration,
    /// Per-queue throughput limit.
    pub rate_limit: Option<RateLimit>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: vec![DEFAULT_QUEUE.to_string()],
            num_workers: 4,
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
            job_timeout: Duration::from_secs(60),
            visibility_timeout: Duration::from_secs(90),
            enable_reaper: true,
            reaper_interval: Duration::from_secs(30),
            batch_size: 100,
            shutdown_timeout: Duration::from_secs(30),
            rate_limit: None,
        }
    }
}

impl WorkerConfig {
    /// Create a new builder.
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder::new()
    }

    /// Reject settings the pool cannot run with.
    ///
    /// A job must finish, or be cut off by its timeout, before its
    /// reservation can be reclaimed.
    pub fn validate(&self) -> Result<()> {
        if self.queues.is_empty() || self.queues.iter().any(|q| q.trim().is_empty()) {
            return Err(QueueError::Config("at least one non-empty queue name is required".into()));
        }
        if self.num_workers == 0 {
            return Err(QueueError::Config("num_workers must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(QueueError::Config("batch_size must be at least 1".into()));
        }
        if self.job_timeout >= self.visibility_timeout {
            return Err(QueueError::Config(format!(
                "job timeout ({}s) must be shorter than the visibility timeout ({}s)",
                self.job_timeout.as_secs(),
                self.visibility_timeout.as_secs()
            )));
        }
        if let Some(limit) = self.rate_limit {
            if limit.max == 0 || limit.per.is_zero() {
                return Err(QueueError::Config("rate limit must allow at least one job per non-zero window".into()));
            }
        }
        Ok(())
    }
}

/// Builder for WorkerConfig.
#[derive(Debug, Default)]
pub struct WorkerConfigBuilder {
    config: WorkerConfig,
}

impl WorkerConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the queues to work, highest priority first.
    pub fn queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    /// Set the number of workers.
    pub fn num_workers(mut self, num: usize) -> Self {
        self.config.num_workers = num;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn error_backoff(mut self, backoff: Duration) -> Self {
        self.config.error_backoff = backoff;
        self
    }

    /// Set the default handler timeout.
    pub fn job_timeout(mut self, timeout: Duration) -> Self {
        self.config.job_timeout = timeout;
        self
    }

    pub fn visibility_timeout(mut self, timeout: Duration) -> Self {
        self.config.visibility_timeout = timeout;
        self
    }

    /// Enable or disable the reaper.
    pub fn enable_reaper(mut self, enable: bool) -> Self {
        self.config.enable_reaper = enable;
        self
    }

    /// Set the reaper interval.
    pub fn reaper_interval(mut self, interval: Duration) -> Self {
        self.config.reaper_interval = interval;
        self
    }

    /// Set the batch size for the reaper.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    pub fn rate_limit(mut self, limit: RateLimit) -> Self {
        self.config.rate_limit = Some(limit);
        self
    }

    /// Build the WorkerConfig.
    pub fn build(self) -> WorkerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = WorkerConfig::default();
        assert_eq!(config.queues, vec!["default".to_string()]);
        assert_eq!(config.num_workers, 4);
        assert!(config.enable_reaper);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = WorkerConfig::builder()
            .queues(["high", "low"])
            .num_workers(2)
            .visibility_timeout(Duration::from_secs(300))
            .rate_limit(RateLimit::per_minute(10))
            .build();

        assert_eq!(config.queues, vec!["high".to_string(), "low".to_string()]);
        assert_eq!(config.num_workers, 2);
        assert_eq!(config.visibility_timeout, Duration::from_secs(300));
        assert_eq!(config.rate_limit, Some(RateLimit::per_minute(10)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let empty: [&str; 0] = [];
        assert!(WorkerConfig::builder().queues(empty).build().validate().is_err());
        assert!(WorkerConfig::builder().queues([" "]).build().validate().is_err());
        assert!(WorkerConfig::builder().num_workers(0).build().validate().is_err());
        assert!(WorkerConfig::builder().batch_size(0).build().validate().is_err());
        assert!(WorkerConfig::builder()
            .rate_limit(RateLimit::per_minute(0))
            .build()
            .validate()
            .is_err());
    }

    #[test]
    fn test_timeout_must_fit_inside_visibility_timeout() {
        let err = WorkerConfig::builder()
            .job_timeout(Duration::from_secs(120))
            .visibility_timeout(Duration::from_secs(90))
            .build()
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("visibility timeout"));
    }
}

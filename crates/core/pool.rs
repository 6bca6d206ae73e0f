//! Worker pool for processing jobs.

use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::task::JoinSet;

use crate::backend::{Backend, SharedBackend};
use crate::config::WorkerConfig;
use crate::election::{AlwaysLeader, LeaderElection};
use crate::error::{QueueError, Result};
use crate::rate_limit::{GovernorRateLimiter, RateLimiter};
use crate::reaper::Reaper;
use crate::registry::JobRegistry;
use crate::worker::{Signals, Worker};

/// Builder for WorkerPool.
#[derive(Default)]
pub struct WorkerPoolBuilder {
    config: WorkerConfig,
    registry: Option<JobRegistry>,
    backend: Option<SharedBackend>,
    elector: Option<Arc<dyn LeaderElection>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
}

impl WorkerPoolBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the backend.
    pub fn backend(mut self, backend: impl Backend + 'static) -> Self {
        self.backend = Some(SharedBackend::new(backend));
        self
    }

    /// Set an already shared backend.
    pub fn shared_backend(mut self, backend: SharedBackend) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set the job registry.
    pub fn registry(mut self, registry: JobRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
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
    pub fn workers(mut self, num: usize) -> Self {
        self.config.num_workers = num;
        self
    }

    /// Set the shutdown timeout.
    pub fn shutdown_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Set the leader elector gating the reaper. Defaults to [`AlwaysLeader`].
    pub fn elector(mut self, elector: impl LeaderElection + 'static) -> Self {
        self.elector = Some(Arc::new(elector));
        self
    }

    /// Set a custom rate limiter, overriding `config.rate_limit`.
    pub fn rate_limiter(mut self, limiter: impl RateLimiter + 'static) -> Self {
        self.rate_limiter = Some(Arc::new(limiter));
        self
    }

    /// Build the WorkerPool with the configured backend.
    pub fn build(self) -> Result<WorkerPool<SharedBackend>> {
        let backend = self
            .backend
            .ok_or_else(|| QueueError::Config("Backend is required".to_string()))?;
        let registry = self
            .registry
            .ok_or_else(|| QueueError::Config("Job registry is required".to_string()))?;

        self.config.validate()?;

        let rate_limiter = match (self.rate_limiter, self.config.rate_limit) {
            (Some(limiter), _) => Some(limiter),
            (None, Some(limit)) => Some(Arc::new(GovernorRateLimiter::new(limit)?) as Arc<dyn RateLimiter>),
            (None, None) => None,
        };

        let mut pool = WorkerPool::new(self.config, registry, backend);
        pool.rate_limiter = rate_limiter;
        if let Some(elector) = self.elector {
            pool.elector = elector;
        }
        Ok(pool)
    }
}

/// Worker pool for processing jobs.
pub struct WorkerPool<B = SharedBackend>
where
    B: Backend + Clone + 'static,
{
    config: Arc<WorkerConfig>,
    registry: Arc<JobRegistry>,
    backend: B,
    elector: Arc<dyn LeaderElection>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    signals: Signals,
}

impl WorkerPool<SharedBackend> {
    /// Create a new builder for WorkerPool.
    pub fn builder() -> WorkerPoolBuilder {
        WorkerPoolBuilder::new()
    }
}

impl<B> WorkerPool<B>
where
    B: Backend + Clone + 'static,
{
    /// Create a new worker pool with the given configuration, registry, and backend.
    pub fn new(config: WorkerConfig, registry: JobRegistry, backend: B) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            backend,
            elector: Arc::new(AlwaysLeader),
            rate_limiter: None,
            signals: Signals::default(),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run the worker pool.
    ///
    /// Blocks until Ctrl-C is received and draining is complete.
    pub async fn run(&self) -> Result<()> {
        self.run_until(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
    }

    /// Run the worker pool until the provided shutdown future completes.
    ///
    /// Spawns the workers and the reaper, blocks until `shutdown` resolves,
    /// then drains in-progress jobs.
    pub async fn run_until<S>(&self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()> + Send,
    {
        self.signals.running.store(true, Ordering::SeqCst);
        self.signals.draining.store(false, Ordering::SeqCst);

        let mut tasks = JoinSet::new();

        if self.config.enable_reaper {
            let reaper = Reaper::new(
                self.backend.clone(),
                self.elector.clone(),
                self.config.reaper_interval,
                self.config.visibility_timeout,
                self.config.batch_size,
                self.signals.running.clone(),
            );
            tasks.spawn(async move { reaper.run().await });
        }

        for worker_id in 0..self.config.num_workers {
            let mut worker = Worker::new(
                worker_id,
                self.backend.clone(),
                self.registry.clone(),
                self.config.clone(),
            )
            .with_signals(self.signals.clone());
            if let Some(limiter) = &self.rate_limiter {
                worker = worker.with_rate_limiter(limiter.clone());
            }
            tasks.spawn(async move { worker.run().await });
        }

        tracing::info!(
            workers = self.config.num_workers,
            queues = %self.config.queues.join(","),
            connection = %self.backend.connection_name(),
            jobs = self.registry.names().len(),
            "Worker pool started"
        );

        shutdown.await;
        tracing::info!("Shutdown requested, draining...");

        self.shutdown().await;

        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "Task failed"),
                Err(e) => tracing::error!(error = %e, "Task panicked"),
            }
        }

        tracing::info!("Worker pool stopped");
        Ok(())
    }

    /// Initiate graceful shutdown.
    ///
    /// Stops claiming new jobs and waits up to `shutdown_timeout` for
    /// in-progress jobs to complete. Jobs still running afterwards keep their
    /// reservation until the reaper reclaims it.
    pub async fn shutdown(&self) {
        self.signals.draining.store(true, Ordering::SeqCst);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;

        while self.signals.in_progress.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    in_progress = self.signals.in_progress.load(Ordering::SeqCst),
                    "Shutdown timeout reached, forcing stop"
                );
                break;
            }

            tokio::select! {
                _ = self.signals.drain_notify.notified() => {}
                _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
            }
        }

        self.signals.running.store(false, Ordering::SeqCst);
    }

    /// Get the number of in-progress jobs.
    pub fn in_progress_count(&self) -> usize {
        self.signals.in_progress.load(Ordering::SeqCst)
    }

    /// Check if the pool is draining.
    pub fn is_draining(&self) -> bool {
        self.signals.draining.load(Ordering::SeqCst)
    }
}

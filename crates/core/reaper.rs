//! Reaper component for expired reservation recovery.
//!
//! A worker that dies mid-job leaves its job reserved forever. The reaper
//! periodically finds reservations older than the visibility timeout and
//! either makes them claimable again or, if the attempts are spent, moves
//! them to failed jobs. Only the elected leader reaps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::Backend;
use crate::election::LeaderElection;
use crate::error::Result;
use crate::job::{current_timestamp, Job};

/// Counts from one reaper round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub released: usize,
    pub failed: usize,
}

/// Reaper that reclaims expired reservations.
pub struct Reaper<B: Backend> {
    backend: B,
    elector: Arc<dyn LeaderElection>,
    interval: Duration,
    visibility_timeout: Duration,
    batch_size: usize,
    running: Arc<AtomicBool>,
}

impl<B: Backend + Clone + 'static> Reaper<B> {
    /// Create a new reaper.
    pub fn new(
        backend: B,
        elector: Arc<dyn LeaderElection>,
        interval: Duration,
        visibility_timeout: Duration,
        batch_size: usize,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            backend,
            elector,
            interval,
            visibility_timeout,
            batch_size,
            running,
        }
    }

    /// Run the reaper loop.
    pub async fn run(&self) -> Result<()> {
        tracing::debug!("Reaper started");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while self.running.load(Ordering::SeqCst) {
            interval.tick().await;

            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            match self.elector.campaign().await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to check leadership");
                    continue;
                }
            }

            if let Err(e) = self.reap(current_timestamp()).await {
                tracing::error!(error = %e, "Failed to reap expired reservations");
            }
        }

        if let Err(e) = self.elector.resign().await {
            tracing::warn!(error = %e, "Failed to resign leadership");
        }

        tracing::debug!("Reaper stopped");
        Ok(())
    }

    /// Reclaim one batch of reservations that expired as of `now`.
    pub async fn reap(&self, now: i64) -> Result<ReapReport> {
        let timeout = i64::try_from(self.visibility_timeout.as_secs()).unwrap_or(i64::MAX);
        let cutoff = now.saturating_sub(timeout);
        let expired = self.backend.expired_reservations(cutoff, self.batch_size).await?;

        let mut report = ReapReport::default();
        if expired.is_empty() {
            return Ok(report);
        }

        tracing::info!(count = expired.len(), "Found expired reservations to reclaim");

        for job in expired {
            match self.reclaim(&job, now).await {
                Ok(Reclaimed::Released) => report.released += 1,
                Ok(Reclaimed::Failed) => report.failed += 1,
                Ok(Reclaimed::Skipped) => {}
                Err(e) => {
                    tracing::error!(job_id = %job.id, queue = %job.queue, error = %e, "Failed to reclaim job");
                }
            }
        }

        tracing::info!(
            released = report.released,
            failed = report.failed,
            "Reaper round complete"
        );
        Ok(report)
    }

    async fn reclaim(&self, job: &Job, now: i64) -> Result<Reclaimed> {
        // an unreadable payload gets one attempt
        let tries = job.decode_payload().map(|p| p.max_tries()).unwrap_or(1);

        if job.attempts >= tries {
            let exception = format!("reservation expired after {} attempt(s)", job.attempts);
            return Ok(match self.backend.fail(job, &exception, now).await? {
                Some(failed_id) => {
                    tracing::warn!(
                        job_id = %job.id,
                        failed_id = %failed_id,
                        queue = %job.queue,
                        attempts = job.attempts,
                        "Expired job moved to failed jobs"
                    );
                    Reclaimed::Failed
                }
                None => Reclaimed::Skipped,
            });
        }

        if self.backend.release(job, now).await? {
            tracing::debug!(job_id = %job.id, queue = %job.queue, attempts = job.attempts, "Released expired reservation");
            Ok(Reclaimed::Released)
        } else {
            Ok(Reclaimed::Skipped)
        }
    }
}

enum Reclaimed {
    Released,
    Failed,
    /// The worker finished or another reaper got there first.
    Skipped,
}

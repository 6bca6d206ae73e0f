//! Per-queue rate limiting.
//!
//! A limiter admits at most `max` jobs per `per` window for each key. Workers
//! use the queue name as the key and pass over a limited queue without
//! claiming from it.

use async_trait::async_trait;
use governor::{
    clock::DefaultClock, middleware::NoOpMiddleware, state::keyed::DashMapStateStore, Quota,
    RateLimiter as Governor,
};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{QueueError, Result};

/// Shrink the state store every N hits.
const SHRINK_INTERVAL: u64 = 1000;

/// Allowed number of hits per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max: u32,
    pub per: Duration,
}

impl RateLimit {
    pub fn new(max: u32, per: Duration) -> Self {
        Self { max, per }
    }

    /// `max` hits per minute.
    pub fn per_minute(max: u32) -> Self {
        Self::new(max, Duration::from_secs(60))
    }
}

/// Result of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

/// Rate limiter capability.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Record one hit for `key` if the limit allows it.
    async fn hit(&self, key: &str) -> Result<RateDecision>;
}

type KeyedLimiter = Governor<String, DashMapStateStore<String>, DefaultClock, NoOpMiddleware>;

/// In-process GCRA rate limiter backed by `governor`.
///
/// Limits apply per process; several worker processes each get their own
/// budget.
#[derive(Clone)]
pub struct GovernorRateLimiter {
    limiter: Arc<KeyedLimiter>,
    limit: RateLimit,
    hits: Arc<AtomicU64>,
}

impl GovernorRateLimiter {
    pub fn new(limit: RateLimit) -> Result<Self> {
        let burst = NonZeroU32::new(limit.max)
            .ok_or_else(|| QueueError::Config("rate limit max must be positive".to_string()))?;
        let quota = Quota::with_period(limit.per / limit.max)
            .ok_or_else(|| QueueError::Config("rate limit window must be positive".to_string()))?
            .allow_burst(burst);

        Ok(Self {
            limiter: Arc::new(Governor::keyed(quota)),
            limit,
            hits: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }
}

#[async_trait]
impl RateLimiter for GovernorRateLimiter {
    async fn hit(&self, key: &str) -> Result<RateDecision> {
        let count = self.hits.fetch_add(1, Ordering::Relaxed);
        if count % SHRINK_INTERVAL == 0 && count > 0 {
            self.limiter.retain_recent();
        }

        match self.limiter.check_key(&key.to_string()) {
            Ok(()) => Ok(RateDecision::Allowed),
            Err(not_until) => {
                let retry_after = not_until
                    .wait_time_from(governor::clock::Clock::now(&DefaultClock::default()));
                Ok(RateDecision::Limited { retry_after })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_limits_rejected() {
        assert!(GovernorRateLimiter::new(RateLimit::new(0, Duration::from_secs(1))).is_err());
        assert!(GovernorRateLimiter::new(RateLimit::new(5, Duration::ZERO)).is_err());
    }

    #[tokio::test]
    async fn test_allows_up_to_max_then_limits() {
        let limiter = GovernorRateLimiter::new(RateLimit::per_minute(3)).unwrap();

        for _ in 0..3 {
            assert!(limiter.hit("emails").await.unwrap().is_allowed());
        }

        match limiter.hit("emails").await.unwrap() {
            RateDecision::Limited { retry_after } => {
                assert!(retry_after > Duration::ZERO);
                assert!(retry_after <= Duration::from_secs(20));
            }
            RateDecision::Allowed => panic!("fourth hit should be limited"),
        }
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = GovernorRateLimiter::new(RateLimit::per_minute(1)).unwrap();

        assert!(limiter.hit("emails").await.unwrap().is_allowed());
        assert!(!limiter.hit("emails").await.unwrap().is_allowed());
        assert!(limiter.hit("reports").await.unwrap().is_allowed());
    }
}

//! Distributed lock capability.
//!
//! A lock is a named lease with an owner and an expiry. Acquiring succeeds
//! when the key is free, expired, or already held by the same owner, in which
//! case the lease is renewed.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::job::current_timestamp;

#[async_trait]
pub trait Lock: Send + Sync {
    /// Try to take or renew `key` for `owner` for `ttl`.
    async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Give up `key` if `owner` holds it. Returns `false` if it did not.
    async fn release(&self, key: &str, owner: &str) -> Result<bool>;
}

#[async_trait]
impl<L: Lock + ?Sized> Lock for Arc<L> {
    async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        (**self).acquire(key, owner, ttl).await
    }

    async fn release(&self, key: &str, owner: &str) -> Result<bool> {
        (**self).release(key, owner).await
    }
}

/// Expiry for a lease taken at `now`, in Unix seconds. Never shorter than a second.
pub fn lease_expiry(now: i64, ttl: Duration) -> i64 {
    let secs = i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX);
    now.saturating_add(secs)
}

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    expires_at: i64,
}

/// Process-local lock table.
#[derive(Debug, Clone, Default)]
pub struct MemoryLock {
    leases: Arc<Mutex<HashMap<String, Lease>>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire as of `now` (Unix seconds).
    pub async fn acquire_at(&self, key: &str, owner: &str, ttl: Duration, now: i64) -> bool {
        let mut leases = self.leases.lock().await;
        if let Some(lease) = leases.get(key) {
            if lease.owner != owner && lease.expires_at > now {
                return false;
            }
        }
        leases.insert(
            key.to_string(),
            Lease {
                owner: owner.to_string(),
                expires_at: lease_expiry(now, ttl),
            },
        );
        true
    }

    /// Current holder of `key`, expired or not.
    pub async fn owner(&self, key: &str) -> Option<String> {
        self.leases.lock().await.get(key).map(|l| l.owner.clone())
    }
}

#[async_trait]
impl Lock for MemoryLock {
    async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        Ok(self.acquire_at(key, owner, ttl, current_timestamp()).await)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<bool> {
        let mut leases = self.leases.lock().await;
        match leases.get(key) {
            Some(lease) if lease.owner == owner => {
                leases.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_acquire_free_key() {
        let lock = MemoryLock::new();
        assert!(lock.acquire("reaper", "a", TTL).await.unwrap());
        assert_eq!(lock.owner("reaper").await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_held_key_rejects_other_owner() {
        let lock = MemoryLock::new();
        assert!(lock.acquire_at("reaper", "a", TTL, 100).await);
        assert!(!lock.acquire_at("reaper", "b", TTL, 110).await);
        assert_eq!(lock.owner("reaper").await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_same_owner_renews() {
        let lock = MemoryLock::new();
        assert!(lock.acquire_at("reaper", "a", TTL, 100).await);
        assert!(lock.acquire_at("reaper", "a", TTL, 125).await);
        // renewed lease still valid at 150
        assert!(!lock.acquire_at("reaper", "b", TTL, 150).await);
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken() {
        let lock = MemoryLock::new();
        assert!(lock.acquire_at("reaper", "a", TTL, 100).await);
        assert!(lock.acquire_at("reaper", "b", TTL, 130).await);
        assert_eq!(lock.owner("reaper").await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_release_only_by_owner() {
        let lock = MemoryLock::new();
        lock.acquire("reaper", "a", TTL).await.unwrap();

        assert!(!lock.release("reaper", "b").await.unwrap());
        assert!(lock.release("reaper", "a").await.unwrap());
        assert!(lock.owner("reaper").await.is_none());
        assert!(!lock.release("reaper", "a").await.unwrap());
    }

    #[test]
    fn test_lease_expiry_minimum_one_second() {
        assert_eq!(lease_expiry(10, Duration::from_millis(10)), 11);
        assert_eq!(lease_expiry(10, TTL), 40);
    }
}

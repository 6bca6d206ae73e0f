//! Leader election capability.
//!
//! Leader-only duties, such as reclaiming expired reservations, ask the
//! elector before every round. Single-process deployments use
//! [`AlwaysLeader`]; several processes sharing one database use a
//! [`LockElection`] over a shared [`Lock`].

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::lock::Lock;

/// Lock key contested by [`LockElection`] candidates by default.
pub const DEFAULT_LEADER_KEY: &str = "queue:leader";

#[async_trait]
pub trait LeaderElection: Send + Sync {
    /// Try to become or stay leader. Idempotent; called every round.
    async fn campaign(&self) -> Result<bool>;

    /// Step down. Default is a no-op.
    async fn resign(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<E: LeaderElection + ?Sized> LeaderElection for Arc<E> {
    async fn campaign(&self) -> Result<bool> {
        (**self).campaign().await
    }

    async fn resign(&self) -> Result<()> {
        (**self).resign().await
    }
}

/// An elector that always wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysLeader;

#[async_trait]
impl LeaderElection for AlwaysLeader {
    async fn campaign(&self) -> Result<bool> {
        Ok(true)
    }
}

/// An elector that never wins, for follower-only processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverLeader;

#[async_trait]
impl LeaderElection for NeverLeader {
    async fn campaign(&self) -> Result<bool> {
        Ok(false)
    }
}

/// Leadership as a renewable lease on a lock key.
///
/// The lease `ttl` must outlast the interval between campaigns or leadership
/// will flap between candidates.
pub struct LockElection<L: Lock> {
    lock: L,
    key: String,
    candidate: String,
    ttl: Duration,
}

impl<L: Lock> LockElection<L> {
    pub fn new(lock: L, ttl: Duration) -> Self {
        Self {
            lock,
            key: DEFAULT_LEADER_KEY.to_string(),
            candidate: candidate_id(),
            ttl,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_candidate(mut self, candidate: impl Into<String>) -> Self {
        self.candidate = candidate.into();
        self
    }

    pub fn candidate(&self) -> &str {
        &self.candidate
    }
}

#[async_trait]
impl<L: Lock> LeaderElection for LockElection<L> {
    async fn campaign(&self) -> Result<bool> {
        let leader = self.lock.acquire(&self.key, &self.candidate, self.ttl).await?;
        tracing::trace!(candidate = %self.candidate, key = %self.key, leader, "Campaigned for leadership");
        Ok(leader)
    }

    async fn resign(&self) -> Result<()> {
        if self.lock.release(&self.key, &self.candidate).await? {
            tracing::info!(candidate = %self.candidate, key = %self.key, "Resigned leadership");
        }
        Ok(())
    }
}

/// Generate a unique candidate id for this process.
pub fn candidate_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let pid = std::process::id();
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", host, pid, &nonce[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::MemoryLock;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_fixed_electors() {
        assert!(AlwaysLeader.campaign().await.unwrap());
        assert!(!NeverLeader.campaign().await.unwrap());
        assert!(NeverLeader.resign().await.is_ok());
    }

    #[tokio::test]
    async fn test_single_leader_among_candidates() {
        let lock = Arc::new(MemoryLock::new());
        let a = LockElection::new(lock.clone(), TTL).with_candidate("a");
        let b = LockElection::new(lock.clone(), TTL).with_candidate("b");

        assert!(a.campaign().await.unwrap());
        assert!(!b.campaign().await.unwrap());
        // renewal keeps the leader
        assert!(a.campaign().await.unwrap());
        assert_eq!(lock.owner(DEFAULT_LEADER_KEY).await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_resign_hands_over() {
        let lock = Arc::new(MemoryLock::new());
        let a = LockElection::new(lock.clone(), TTL).with_candidate("a");
        let b = LockElection::new(lock.clone(), TTL).with_candidate("b");

        assert!(a.campaign().await.unwrap());
        a.resign().await.unwrap();
        assert!(b.campaign().await.unwrap());
    }

    #[tokio::test]
    async fn test_custom_key_is_independent() {
        let lock = Arc::new(MemoryLock::new());
        let a = LockElection::new(lock.clone(), TTL).with_candidate("a");
        let b = LockElection::new(lock.clone(), TTL)
            .with_candidate("b")
            .with_key("scheduler:leader");

        assert!(a.campaign().await.unwrap());
        assert!(b.campaign().await.unwrap());
    }

    #[test]
    fn test_candidate_ids_are_unique() {
        let a = candidate_id();
        let b = candidate_id();
        assert_ne!(a, b);
        assert!(a.contains(&std::process::id().to_string()));
    }
}

//! Lock leases stored in the `cache_locks` table.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use std::time::Duration;
use stacks_queue_core::{current_timestamp, lease_expiry, Lock, QueueError, Result};

/// Lock shared by every process using the same database.
#[derive(Clone)]
pub struct SqliteLock {
    pool: SqlitePool,
}

impl SqliteLock {
    /// Wrap a pool whose database already has the `cache_locks` table.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Acquire as of `now` (Unix seconds).
    pub async fn acquire_at(&self, key: &str, owner: &str, ttl: Duration, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO cache_locks (key, owner, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET owner = excluded.owner, expires_at = excluded.expires_at
            WHERE cache_locks.expires_at <= ? OR cache_locks.owner = excluded.owner
            "#,
        )
        .bind(key)
        .bind(owner)
        .bind(lease_expiry(now, ttl))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Lock(format!("Failed to acquire lock {}: {}", key, e)))?;

        Ok(result.rows_affected() > 0)
    }

    /// Current holder of `key`, expired or not.
    pub async fn owner(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT owner FROM cache_locks WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| QueueError::Lock(format!("Failed to read lock {}: {}", key, e)))?;

        Ok(row.map(|(owner,)| owner))
    }
}

#[async_trait]
impl Lock for SqliteLock {
    async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        self.acquire_at(key, owner, ttl, current_timestamp()).await
    }

    async fn release(&self, key: &str, owner: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM cache_locks WHERE key = ? AND owner = ?")
            .bind(key)
            .bind(owner)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Lock(format!("Failed to release lock {}: {}", key, e)))?;

        Ok(result.rows_affected() > 0)
    }
}

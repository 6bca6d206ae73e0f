//! SQLite backend for the stacks job queue.
//!
//! This crate provides a SQLite-based storage backend and lock for the job
//! queue. Active jobs live in `jobs`, exhausted ones in `failed_jobs`, and
//! lock leases in `cache_locks`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use stacks_queue_sqlite::SqliteBackend;
//! use stacks_queue_core::Client;
//!
//! #[tokio::main]
//! async fn main() -> stacks_queue_core::Result<()> {
//!     let backend = SqliteBackend::new("sqlite:database/stacks.sqlite").await?;
//!     let client = Client::new(backend);
//!     Ok(())
//! }
//! ```

mod lock;

pub use lock::SqliteLock;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use stacks_queue_core::{
    current_timestamp, Backend, FailedJob, FailedJobId, Job, JobId, NewJob, Payload, QueueError,
    Result,
};

/// Value written to `failed_jobs.connection`.
pub const CONNECTION_NAME: &str = "database";

const JOB_COLUMNS: &str =
    "id, queue, payload, attempts, reserved_at, available_at, overlap_key, created_at, updated_at";

const FAILED_JOB_COLUMNS: &str =
    "id, connection, queue, payload, exception, failed_at, created_at, updated_at";

type JobRow = (
    i64,
    String,
    String,
    i64,
    Option<i64>,
    i64,
    Option<String>,
    i64,
    i64,
);

type FailedJobRow = (i64, String, String, String, String, i64, i64, i64);

fn job_from_row(row: JobRow) -> Job {
    let (id, queue, payload, attempts, reserved_at, available_at, overlap_key, created_at, updated_at) =
        row;
    Job {
        id: JobId(id),
        queue,
        payload,
        attempts: u32::try_from(attempts).unwrap_or_default(),
        reserved_at,
        available_at,
        overlap_key,
        created_at,
        updated_at,
    }
}

fn failed_job_from_row(row: FailedJobRow) -> FailedJob {
    let (id, connection, queue, payload, exception, failed_at, created_at, updated_at) = row;
    FailedJob {
        id: FailedJobId(id),
        connection,
        queue,
        payload,
        exception,
        failed_at,
        created_at,
        updated_at,
    }
}

/// SQLite backend for job queue storage.
#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Create a new SQLite backend.
    ///
    /// The database_url should be in the format: `sqlite:path/to/db.sqlite` or
    /// `sqlite::memory:`. The file is created if missing.
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| QueueError::Config(format!("Invalid SQLite URL {}: {}", database_url, e)))?
            .create_if_missing(true);

        // one connection serializes writers; an in-memory database also
        // vanishes with its last connection, so it must never be recycled
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| QueueError::Backend(format!("Failed to connect to SQLite: {}", e)))?;

        Self::from_pool(pool).await
    }

    /// Create an in-memory SQLite backend (useful for testing).
    pub async fn in_memory() -> Result<Self> {
        Self::new("sqlite::memory:").await
    }

    /// Use an existing pool, creating tables if needed.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let backend = Self { pool };
        backend.init_tables().await?;
        tracing::debug!("SQLite queue tables ready");
        Ok(backend)
    }

    /// A lock sharing this backend's database.
    pub fn lock(&self) -> SqliteLock {
        SqliteLock::new(self.pool.clone())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Initialize the required tables.
    async fn init_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                payload TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                reserved_at INTEGER,
                available_at INTEGER NOT NULL,
                overlap_key TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(format!("Failed to create jobs table: {}", e)))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_queue_reserved_available ON jobs (queue, reserved_at, available_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(format!("Failed to create jobs index: {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS failed_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                connection TEXT NOT NULL,
                queue TEXT NOT NULL,
                payload TEXT NOT NULL,
                exception TEXT NOT NULL,
                failed_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(format!("Failed to create failed_jobs table: {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_locks (
                key TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(format!("Failed to create cache_locks table: {}", e)))?;

        Ok(())
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    fn connection_name(&self) -> &str {
        CONNECTION_NAME
    }

    async fn push(&self, job: NewJob) -> Result<JobId> {
        let now = current_timestamp();
        let result = sqlx::query(
            "INSERT INTO jobs (queue, payload, attempts, reserved_at, available_at, overlap_key, created_at, updated_at) \
             VALUES (?, ?, 0, NULL, ?, ?, ?, ?)",
        )
        .bind(&job.queue)
        .bind(&job.payload)
        .bind(job.available_at)
        .bind(&job.overlap_key)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(format!("Failed to push job: {}", e)))?;

        Ok(JobId(result.last_insert_rowid()))
    }

    async fn claim(&self, queue: &str, now: i64) -> Result<Option<Job>> {
        // single statement: the row is reserved by whoever updates it first
        let row: Option<JobRow> = sqlx::query_as(&format!(
            r#"
            UPDATE jobs
            SET reserved_at = ?, attempts = attempts + 1, updated_at = ?
            WHERE id = (
                SELECT id FROM jobs
                WHERE queue = ?
                  AND reserved_at IS NULL
                  AND available_at <= ?
                  AND (overlap_key IS NULL OR overlap_key NOT IN (
                      SELECT overlap_key FROM jobs
                      WHERE reserved_at IS NOT NULL AND overlap_key IS NOT NULL
                  ))
                ORDER BY id
                LIMIT 1
            )
            AND reserved_at IS NULL
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(now)
        .bind(now)
        .bind(queue)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(format!("Failed to claim job: {}", e)))?;

        Ok(row.map(job_from_row))
    }

    async fn complete(&self, job: &Job) -> Result<bool> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ? AND reserved_at = ? AND attempts = ?")
            .bind(job.id.0)
            .bind(job.reserved_at)
            .bind(i64::from(job.attempts))
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(format!("Failed to complete job: {}", e)))?;

        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, job: &Job, available_at: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET reserved_at = NULL, available_at = ?, updated_at = ? \
             WHERE id = ? AND reserved_at = ? AND attempts = ?",
        )
        .bind(available_at)
        .bind(current_timestamp())
        .bind(job.id.0)
        .bind(job.reserved_at)
        .bind(i64::from(job.attempts))
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(format!("Failed to release job: {}", e)))?;

        Ok(result.rows_affected() > 0)
    }

    async fn fail(
        &self,
        job: &Job,
        exception: &str,
        failed_at: i64,
    ) -> Result<Option<FailedJobId>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| QueueError::Backend(format!("Failed to begin transaction: {}", e)))?;

        let removed: Option<(String, String)> = sqlx::query_as(
            "DELETE FROM jobs WHERE id = ? AND reserved_at = ? AND attempts = ? RETURNING queue, payload",
        )
        .bind(job.id.0)
        .bind(job.reserved_at)
        .bind(i64::from(job.attempts))
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| QueueError::Backend(format!("Failed to remove failed job: {}", e)))?;

        let Some((queue, payload)) = removed else {
            return Ok(None);
        };

        let result = sqlx::query(
            "INSERT INTO failed_jobs (connection, queue, payload, exception, failed_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(CONNECTION_NAME)
        .bind(&queue)
        .bind(&payload)
        .bind(exception)
        .bind(failed_at)
        .bind(failed_at)
        .bind(failed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| QueueError::Backend(format!("Failed to record failed job: {}", e)))?;

        let failed_id = FailedJobId(result.last_insert_rowid());

        tx.commit()
            .await
            .map_err(|e| QueueError::Backend(format!("Failed to commit transaction: {}", e)))?;

        Ok(Some(failed_id))
    }

    async fn clear(&self, queue: Option<&str>) -> Result<u64> {
        let result = match queue {
            Some(queue) => sqlx::query("DELETE FROM jobs WHERE queue = ?")
                .bind(queue)
                .execute(&self.pool)
                .await,
            None => sqlx::query("DELETE FROM jobs").execute(&self.pool).await,
        }
        .map_err(|e| QueueError::Backend(format!("Failed to clear jobs: {}", e)))?;

        Ok(result.rows_affected())
    }

    async fn expired_reservations(&self, reserved_before: i64, limit: usize) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM jobs WHERE reserved_at IS NOT NULL AND reserved_at <= ? ORDER BY id LIMIT ?",
            JOB_COLUMNS
        ))
        .bind(reserved_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(format!("Failed to get expired reservations: {}", e)))?;

        Ok(rows.into_iter().map(job_from_row).collect())
    }

    async fn job(&self, id: JobId) -> Result<Option<Job>> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| QueueError::Backend(format!("Failed to get job: {}", e)))?;

        Ok(row.map(job_from_row))
    }

    async fn len(&self, queue: Option<&str>) -> Result<usize> {
        let row: (i64,) = match queue {
            Some(queue) => sqlx::query_as("SELECT COUNT(*) FROM jobs WHERE queue = ?")
                .bind(queue)
                .fetch_one(&self.pool)
                .await,
            None => sqlx::query_as("SELECT COUNT(*) FROM jobs")
                .fetch_one(&self.pool)
                .await,
        }
        .map_err(|e| QueueError::Backend(format!("Failed to get queue length: {}", e)))?;

        Ok(row.0 as usize)
    }

    async fn requeue(&self, id: FailedJobId, now: i64) -> Result<Option<JobId>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| QueueError::Backend(format!("Failed to begin transaction: {}", e)))?;

        let removed: Option<(String, String)> =
            sqlx::query_as("DELETE FROM failed_jobs WHERE id = ? RETURNING queue, payload")
                .bind(id.0)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| QueueError::Backend(format!("Failed to remove failed job: {}", e)))?;

        let Some((queue, payload)) = removed else {
            return Ok(None);
        };

        let overlap_key = Payload::from_json(&payload)
            .ok()
            .and_then(|p| p.overlap_identity());

        let result = sqlx::query(
            "INSERT INTO jobs (queue, payload, attempts, reserved_at, available_at, overlap_key, created_at, updated_at) \
             VALUES (?, ?, 0, NULL, ?, ?, ?, ?)",
        )
        .bind(&queue)
        .bind(&payload)
        .bind(now)
        .bind(&overlap_key)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| QueueError::Backend(format!("Failed to requeue job: {}", e)))?;

        let job_id = JobId(result.last_insert_rowid());

        tx.commit()
            .await
            .map_err(|e| QueueError::Backend(format!("Failed to commit transaction: {}", e)))?;

        Ok(Some(job_id))
    }

    async fn flush(&self, queue: Option<&str>) -> Result<u64> {
        let result = match queue {
            Some(queue) => sqlx::query("DELETE FROM failed_jobs WHERE queue = ?")
                .bind(queue)
                .execute(&self.pool)
                .await,
            None => sqlx::query("DELETE FROM failed_jobs").execute(&self.pool).await,
        }
        .map_err(|e| QueueError::Backend(format!("Failed to flush failed jobs: {}", e)))?;

        Ok(result.rows_affected())
    }

    async fn failed_job(&self, id: FailedJobId) -> Result<Option<FailedJob>> {
        let row: Option<FailedJobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM failed_jobs WHERE id = ?",
            FAILED_JOB_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(format!("Failed to get failed job: {}", e)))?;

        Ok(row.map(failed_job_from_row))
    }

    async fn failed_ids(&self, queue: Option<&str>) -> Result<Vec<FailedJobId>> {
        let rows: Vec<(i64,)> = match queue {
            Some(queue) => sqlx::query_as("SELECT id FROM failed_jobs WHERE queue = ? ORDER BY id")
                .bind(queue)
                .fetch_all(&self.pool)
                .await,
            None => sqlx::query_as("SELECT id FROM failed_jobs ORDER BY id")
                .fetch_all(&self.pool)
                .await,
        }
        .map_err(|e| QueueError::Backend(format!("Failed to list failed job ids: {}", e)))?;

        Ok(rows.into_iter().map(|(id,)| FailedJobId(id)).collect())
    }

    async fn list_failed(&self, limit: usize, offset: usize) -> Result<Vec<FailedJob>> {
        let rows: Vec<FailedJobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM failed_jobs ORDER BY id DESC LIMIT ? OFFSET ?",
            FAILED_JOB_COLUMNS
        ))
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(format!("Failed to list failed jobs: {}", e)))?;

        Ok(rows.into_iter().map(failed_job_from_row).collect())
    }

    async fn failed_len(&self, queue: Option<&str>) -> Result<usize> {
        let row: (i64,) = match queue {
            Some(queue) => sqlx::query_as("SELECT COUNT(*) FROM failed_jobs WHERE queue = ?")
                .bind(queue)
                .fetch_one(&self.pool)
                .await,
            None => sqlx::query_as("SELECT COUNT(*) FROM failed_jobs")
                .fetch_one(&self.pool)
                .await,
        }
        .map_err(|e| QueueError::Backend(format!("Failed to get failed job count: {}", e)))?;

        Ok(row.0 as usize)
    }
}

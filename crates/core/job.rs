//! Job and failed-job records and the payload envelope stored with them.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backoff::Backoff;

/// Queue used when a job does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// Row identifier of an active job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub i64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Row identifier of a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FailedJobId(pub i64);

impl std::fmt::Display for FailedJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Retry policy attached to a job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub tries: u32,
    /// Delay strategy between attempts.
    pub backoff: Backoff,
    /// Never run two jobs with the same overlap key at once.
    pub without_overlapping: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            tries: 3,
            backoff: Backoff::default(),
            without_overlapping: false,
        }
    }
}

/// The serialized work description stored in a job's `payload` column.
///
/// The retry policy travels inside the payload so the worker can decide
/// between retry and failure without consulting the job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Registered job name.
    pub job: String,
    /// Job-specific data.
    pub data: serde_json::Value,
    pub tries: u32,
    #[serde(default)]
    pub backoff: Backoff,
    /// Handler timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub without_overlapping: bool,
    /// Identity for `without_overlapping`; the job name when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlap_key: Option<String>,
}

impl Payload {
    /// Build a payload from a job name, its data and policy.
    pub fn new(job: impl Into<String>, data: serde_json::Value, policy: &RetryPolicy) -> Self {
        Self {
            job: job.into(),
            data,
            tries: policy.tries,
            backoff: policy.backoff.clone(),
            timeout: None,
            without_overlapping: policy.without_overlapping,
            overlap_key: None,
        }
    }

    /// Override the overlap identity, e.g. to serialize per record.
    pub fn with_overlap_key(mut self, key: impl Into<String>) -> Self {
        self.overlap_key = Some(key.into());
        self
    }

    /// Key that must not be reserved twice at once, if overlap is prevented.
    pub fn overlap_identity(&self) -> Option<String> {
        if !self.without_overlapping {
            return None;
        }
        Some(self.overlap_key.clone().unwrap_or_else(|| self.job.clone()))
    }

    /// Set the handler timeout.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout.map(|t| t.as_secs().max(1));
        self
    }

    /// Attempt budget, never less than one.
    pub fn max_tries(&self) -> u32 {
        self.tries.max(1)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// A job waiting in, or reserved from, the active queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    /// Serialized [`Payload`].
    pub payload: String,
    /// Number of times a worker has claimed this job.
    pub attempts: u32,
    /// When the current reservation started (Unix seconds).
    pub reserved_at: Option<i64>,
    /// Earliest time the job may be claimed (Unix seconds).
    pub available_at: i64,
    /// Identity used by `without_overlapping`; `None` when the job may overlap.
    pub overlap_key: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Job {
    pub fn is_reserved(&self) -> bool {
        self.reserved_at.is_some()
    }

    /// Decode the payload envelope.
    pub fn decode_payload(&self) -> Result<Payload, serde_json::Error> {
        Payload::from_json(&self.payload)
    }
}

/// A job about to be inserted into the active queue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub queue: String,
    pub payload: String,
    pub available_at: i64,
    pub overlap_key: Option<String>,
}

impl NewJob {
    /// A job available immediately on the default queue.
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            payload: payload.into(),
            available_at: current_timestamp(),
            overlap_key: None,
        }
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn available_at(mut self, timestamp: i64) -> Self {
        self.available_at = timestamp;
        self
    }

    pub fn overlap_key(mut self, key: Option<String>) -> Self {
        self.overlap_key = key;
        self
    }
}

/// Terminal record of a job that exhausted its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedJob {
    pub id: FailedJobId,
    /// Storage connection the job ran on.
    pub connection: String,
    pub queue: String,
    pub payload: String,
    /// Failure reason reported by the last attempt.
    pub exception: String,
    pub failed_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Get current Unix timestamp in seconds.
pub fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

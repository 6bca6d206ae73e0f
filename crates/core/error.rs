//! Error types for the queue core.

use thiserror::Error;

use crate::job::{FailedJobId, JobId};

/// The main error type for queue storage and coordination.
///
/// Handler failures are not represented here: they are [`crate::JobError`]s
/// and drive job state transitions instead of propagating.
#[derive(Error, Debug)]
pub enum QueueError {
    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Job not found in the active queue.
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// No failed job with this id.
    #[error("Failed job not found: {0}")]
    FailedJobNotFound(FailedJobId),

    /// Storage-specific error.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Lock or leader election error.
    #[error("Lock error: {0}")]
    Lock(String),
}

/// Result type alias using QueueError.
pub type Result<T> = std::result::Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_serialization() {
        let json_err: serde_json::Error = serde_json::from_str::<i32>("invalid").unwrap_err();
        let err = QueueError::Serialization(json_err);
        assert!(err.to_string().starts_with("Serialization error:"));
    }

    #[test]
    fn test_error_display_config() {
        let err = QueueError::Config("workers must be positive".to_string());
        assert_eq!(err.to_string(), "Configuration error: workers must be positive");
    }

    #[test]
    fn test_error_display_not_found() {
        assert_eq!(QueueError::JobNotFound(JobId(7)).to_string(), "Job not found: 7");
        assert_eq!(
            QueueError::FailedJobNotFound(FailedJobId(12)).to_string(),
            "Failed job not found: 12"
        );
    }

    #[test]
    fn test_error_display_backend() {
        let err = QueueError::Backend("database is locked".to_string());
        assert_eq!(err.to_string(), "Backend error: database is locked");
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err: serde_json::Error = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: QueueError = json_err.into();
        assert!(matches!(err, QueueError::Serialization(_)));
    }
}

//! Job registry mapping job names to handlers.
//!
//! The registry is built once at startup and shared by every worker. Jobs
//! are looked up by the name stored in their payload.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::backoff::Backoff;
use crate::job::{RetryPolicy, DEFAULT_QUEUE};
use crate::worker::{JobError, JobResult};

/// A job type that can be dispatched onto a queue and handled by a worker.
///
/// ```rust,ignore
/// #[derive(Serialize, Deserialize)]
/// struct SendEmail { to: String }
///
/// #[async_trait]
/// impl Queueable for SendEmail {
///     const NAME: &'static str = "send-email";
///
///     fn backoff() -> Backoff {
///         Backoff::Sequence(vec![60, 120, 300])
///     }
///
///     async fn handle(&self) -> JobResult {
///         mailer::send(&self.to).await?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Queueable: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Name stored in the payload and used for handler lookup.
    const NAME: &'static str;

    /// Queue the job is dispatched to by default.
    fn queue() -> &'static str {
        DEFAULT_QUEUE
    }

    /// Maximum number of attempts.
    fn tries() -> u32 {
        3
    }

    fn backoff() -> Backoff {
        Backoff::default()
    }

    /// Prevent two jobs with the same overlap key from running at once.
    fn without_overlapping() -> bool {
        false
    }

    /// Overlap identity for this instance; defaults to the job name.
    fn overlap_key(&self) -> Option<String> {
        None
    }

    /// Handler timeout; the worker default applies when `None`.
    fn timeout() -> Option<Duration> {
        None
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            tries: Self::tries(),
            backoff: Self::backoff(),
            without_overlapping: Self::without_overlapping(),
        }
    }

    async fn handle(&self) -> JobResult;
}

type HandlerFuture = Pin<Box<dyn Future<Output = JobResult> + Send>>;

/// Type-erased handler taking the payload's `data` value.
type Handler = Arc<dyn Fn(serde_json::Value) -> HandlerFuture + Send + Sync>;

/// Registry for mapping job names to their handlers.
#[derive(Clone, Default)]
pub struct JobRegistry {
    handlers: HashMap<String, Handler>,
}

impl JobRegistry {
    /// Create a new empty job registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a [`Queueable`] job type.
    pub fn register<J: Queueable>(&mut self) -> &mut Self {
        self.register_fn(J::NAME, |data| async move {
            let job: J = serde_json::from_value(data).map_err(|e| {
                JobError::fatal(format!("invalid data for job `{}`: {}", J::NAME, e))
            })?;
            job.handle().await
        })
    }

    /// Register a handler function under `name`.
    ///
    /// The handler receives the payload's `data` value as stored.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        let wrapped: Handler =
            Arc::new(move |data: serde_json::Value| -> HandlerFuture { Box::pin(handler(data)) });
        let name = name.into();
        if self.handlers.insert(name.clone(), wrapped).is_some() {
            tracing::warn!(job = %name, "Job handler registered twice, keeping the last one");
        }
        self
    }

    /// Run the handler registered for `name`.
    ///
    /// Returns `None` if no handler is registered.
    pub fn execute(&self, name: &str, data: serde_json::Value) -> Option<HandlerFuture> {
        self.handlers.get(name).map(|handler| handler(data))
    }

    /// Check if a job name is registered.
    pub fn is_registered(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered job names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

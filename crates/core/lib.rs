//! # stacks-queue-core - Core types and traits for the job queue
//!
//! This crate provides the reliability core of the queue:
//! - `Backend` trait for storage implementations, plus an in-memory backend
//! - `Job`, `FailedJob` and `Payload` records
//! - `Backoff` strategies and a generic `retry` executor
//! - `JobRegistry` and the `Queueable` trait for job definitions
//! - `Client` for dispatching jobs
//! - `WorkerPool` and the visibility-timeout `Reaper`
//! - Lock, leader election and rate limiting capabilities
//! - Error types

mod backend;
mod backoff;
mod client;
mod config;
mod election;
mod error;
mod job;
mod lock;
mod memory;
mod pool;
mod rate_limit;
mod reaper;
mod registry;
mod retry;
mod worker;

// Re-export main types
pub use backend::{Backend, DynBackend, SharedBackend};
pub use backoff::{calculate_delay, Backoff, JITTER_RATIO};
pub use client::Client;
pub use config::{WorkerConfig, WorkerConfigBuilder};
pub use election::{candidate_id, AlwaysLeader, LeaderElection, LockElection, NeverLeader, DEFAULT_LEADER_KEY};
pub use error::{QueueError, Result};
pub use job::{
    current_timestamp, FailedJob, FailedJobId, Job, JobId, NewJob, Payload, RetryPolicy,
    DEFAULT_QUEUE,
};
pub use lock::{lease_expiry, Lock, MemoryLock};
pub use memory::MemoryBackend;
pub use pool::{WorkerPool, WorkerPoolBuilder};
pub use rate_limit::{GovernorRateLimiter, RateDecision, RateLimit, RateLimiter};
pub use reaper::{ReapReport, Reaper};
pub use registry::{JobRegistry, Queueable};
pub use retry::{retry, RetryOptions};
pub use worker::{JobError, JobResult, Outcome, Worker};

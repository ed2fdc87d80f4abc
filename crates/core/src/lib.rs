//! `jobq-core`: domain model for the job queue.
//!
//! This crate contains **pure domain** types (no storage, no processes):
//! jobs and runs, the lifecycle state machine, the retry policy, and the
//! typed configuration.

pub mod config;
pub mod error;
pub mod id;
pub mod job;
pub mod retry;
pub mod state;

pub use config::QueueConfig;
pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use job::{DEFAULT_PRIORITY, EnqueueRequest, Job, JobRun, JobStats, NewJob, NewJobRun};
pub use retry::{RetryDecision, RetryPolicy};
pub use state::{JobState, Transition};

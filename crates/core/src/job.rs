//! Job and job-run records.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::QueueConfig;
use crate::error::DomainError;
use crate::id::JobId;
use crate::state::JobState;

/// Priority assigned when the caller does not choose one. Lower runs first.
pub const DEFAULT_PRIORITY: i64 = 100;

/// A persisted job: its command plus current scheduling state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Shell command line, passed verbatim to the interpreter.
    pub command: String,
    pub state: JobState,
    /// Execution attempts so far.
    pub attempts: u32,
    /// Attempts allowed before the job is dead-lettered.
    pub max_retries: u32,
    /// Lower = scheduled earlier.
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Originally requested start time, if any.
    pub run_at: Option<DateTime<Utc>>,
    /// Earliest time the job may be claimed next.
    pub next_run_at: Option<DateTime<Utc>>,
    /// Per-job override of the default execution timeout.
    pub timeout_secs: Option<u64>,
    /// Worker currently holding the job; set iff `state == processing`.
    pub worker: Option<String>,
    pub last_error: Option<String>,
}

impl Job {
    /// Pending and due.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Pending && self.next_run_at.is_none_or(|at| at <= now)
    }

    /// Failed and its backoff has elapsed.
    pub fn is_due_for_retry(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Failed && self.next_run_at.is_none_or(|at| at <= now)
    }

    pub fn effective_timeout(&self, default_timeout: Duration) -> Duration {
        self.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(default_timeout)
    }
}

/// Enqueue payload as received from a caller (CLI JSON, API body).
///
/// Everything except `command` is optional; [`EnqueueRequest::validate`]
/// fills in defaults and rejects malformed input before it reaches a store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnqueueRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub command: String,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl EnqueueRequest {
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            command: command.into(),
            ..Default::default()
        }
    }

    /// Parse a JSON object.
    pub fn from_json(raw: &str) -> Result<Self, DomainError> {
        serde_json::from_str(raw).map_err(|e| DomainError::validation(format!("invalid job JSON: {e}")))
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Validate and resolve defaults. A missing id is generated.
    pub fn validate(self, defaults: &QueueConfig) -> Result<NewJob, DomainError> {
        let id = match self.id {
            Some(raw) => JobId::new(raw)?,
            None => JobId::generate(),
        };
        if self.command.trim().is_empty() {
            return Err(DomainError::validation("command must not be empty"));
        }
        if self.timeout_secs == Some(0) {
            return Err(DomainError::validation("timeout_secs must be positive"));
        }
        Ok(NewJob {
            id,
            command: self.command,
            priority: self.priority.unwrap_or(DEFAULT_PRIORITY),
            run_at: self.run_at,
            timeout_secs: self.timeout_secs,
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
        })
    }
}

/// A validated job ready to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub id: JobId,
    pub command: String,
    pub priority: i64,
    pub run_at: Option<DateTime<Utc>>,
    pub timeout_secs: Option<u64>,
    pub max_retries: u32,
}

impl NewJob {
    /// Materialize the row as first persisted at `now`.
    ///
    /// `next_run_at` starts at `run_at` when scheduled, else at `now`.
    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            id: self.id,
            command: self.command,
            state: JobState::Pending,
            attempts: 0,
            max_retries: self.max_retries,
            priority: self.priority,
            created_at: now,
            updated_at: now,
            run_at: self.run_at,
            next_run_at: Some(self.run_at.unwrap_or(now)),
            timeout_secs: self.timeout_secs,
            worker: None,
            last_error: None,
        }
    }
}

/// One recorded execution attempt. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRun {
    pub id: i64,
    pub job_id: JobId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub bytes_stdout: u64,
    pub bytes_stderr: u64,
}

/// A run about to be recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJobRun {
    pub job_id: JobId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub bytes_stdout: u64,
    pub bytes_stderr: u64,
}

impl NewJobRun {
    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at).num_milliseconds().max(0) as u64
    }
}

/// Counts per state plus totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
    pub total_jobs: u64,
    pub total_runs: u64,
}

impl JobStats {
    pub fn count(&self, state: JobState) -> u64 {
        match state {
            JobState::Pending => self.pending,
            JobState::Processing => self.processing,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
            JobState::Dead => self.dead,
        }
    }

    /// Add `n` jobs in `state`, keeping `total_jobs` in step.
    pub fn add(&mut self, state: JobState, n: u64) {
        let slot = match state {
            JobState::Pending => &mut self.pending,
            JobState::Processing => &mut self.processing,
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
            JobState::Dead => &mut self.dead,
        };
        *slot += n;
        self.total_jobs += n;
    }
}

//! Job store abstraction.

use std::sync::Arc;

use jobq_core::{Job, JobId, JobRun, JobState, JobStats, NewJob, NewJobRun, RetryPolicy};

use crate::error::JobStoreError;

/// Attempt counters returned by [`JobStore::increment_attempts`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptCount {
    pub attempts: u32,
    pub max_retries: u32,
}

/// Persistence and claim protocol for jobs.
///
/// Every mutating method is a single atomic step against the backing store:
/// concurrent callers (threads or processes) never observe or produce a
/// half-applied transition.
pub trait JobStore: Send + Sync {
    /// Insert a new `pending` job. Duplicate ids are rejected.
    fn enqueue(&self, job: NewJob) -> Result<Job, JobStoreError>;

    /// Get a job by id.
    fn get(&self, id: &JobId) -> Result<Option<Job>, JobStoreError>;

    /// List jobs, optionally filtered by state, oldest first.
    fn list(&self, state: Option<JobState>) -> Result<Vec<Job>, JobStoreError>;

    /// Counts per state plus totals.
    fn stats(&self) -> Result<JobStats, JobStoreError>;

    /// Move every due `failed` job back to `pending`. Returns how many moved.
    fn sweep_due_retries(&self) -> Result<usize, JobStoreError>;

    /// Sweep, then atomically claim the next eligible job for `worker`.
    ///
    /// Eligible = `pending` and due. Order: priority, next_run_at,
    /// created_at. At most one caller can ever claim a given job.
    fn claim_next(&self, worker: &str) -> Result<Option<Job>, JobStoreError>;

    /// processing → completed.
    fn complete(&self, id: &JobId) -> Result<Job, JobStoreError>;

    /// Count one more execution attempt of a `processing` job.
    fn increment_attempts(&self, id: &JobId) -> Result<AttemptCount, JobStoreError>;

    /// processing → failed (with backoff) or → dead, as `policy` decides.
    fn reschedule_or_dead(
        &self,
        id: &JobId,
        error: &str,
        attempts: u32,
        max_retries: u32,
        policy: &RetryPolicy,
    ) -> Result<Job, JobStoreError>;

    /// dead → pending, resetting attempts and clearing the last error.
    fn retry_from_dead_letter(&self, id: &JobId) -> Result<Job, JobStoreError>;

    /// Append one execution record.
    fn record_run(&self, run: NewJobRun) -> Result<JobRun, JobStoreError>;

    /// Most recent runs, newest first.
    fn recent_runs(&self, limit: usize) -> Result<Vec<JobRun>, JobStoreError>;
}

impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    fn enqueue(&self, job: NewJob) -> Result<Job, JobStoreError> {
        (**self).enqueue(job)
    }

    fn get(&self, id: &JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(id)
    }

    fn list(&self, state: Option<JobState>) -> Result<Vec<Job>, JobStoreError> {
        (**self).list(state)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats()
    }

    fn sweep_due_retries(&self) -> Result<usize, JobStoreError> {
        (**self).sweep_due_retries()
    }

    fn claim_next(&self, worker: &str) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next(worker)
    }

    fn complete(&self, id: &JobId) -> Result<Job, JobStoreError> {
        (**self).complete(id)
    }

    fn increment_attempts(&self, id: &JobId) -> Result<AttemptCount, JobStoreError> {
        (**self).increment_attempts(id)
    }

    fn reschedule_or_dead(
        &self,
        id: &JobId,
        error: &str,
        attempts: u32,
        max_retries: u32,
        policy: &RetryPolicy,
    ) -> Result<Job, JobStoreError> {
        (**self).reschedule_or_dead(id, error, attempts, max_retries, policy)
    }

    fn retry_from_dead_letter(&self, id: &JobId) -> Result<Job, JobStoreError> {
        (**self).retry_from_dead_letter(id)
    }

    fn record_run(&self, run: NewJobRun) -> Result<JobRun, JobStoreError> {
        (**self).record_run(run)
    }

    fn recent_runs(&self, limit: usize) -> Result<Vec<JobRun>, JobStoreError> {
        (**self).recent_runs(limit)
    }
}

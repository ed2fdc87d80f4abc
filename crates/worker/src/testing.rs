//! Store wrapper whose writes fail a set number of times.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};

use jobq_core::{Job, JobId, JobRun, JobState, JobStats, NewJob, NewJobRun, RetryPolicy};
use jobq_store::{AttemptCount, JobStore, JobStoreError};

pub(crate) struct FlakyStore<S> {
    inner: S,
    record_failures: AtomicU32,
    complete_failures: AtomicU32,
}

impl<S: JobStore> FlakyStore<S> {
    pub(crate) fn new(inner: S) -> Self {
        Self {
            inner,
            record_failures: AtomicU32::new(0),
            complete_failures: AtomicU32::new(0),
        }
    }

    pub(crate) fn failing_record_run(self, times: u32) -> Self {
        self.record_failures.store(times, Ordering::SeqCst);
        self
    }

    pub(crate) fn failing_complete(self, times: u32) -> Self {
        self.complete_failures.store(times, Ordering::SeqCst);
        self
    }

    fn trip(counter: &AtomicU32) -> Result<(), JobStoreError> {
        let tripped = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            Err(JobStoreError::Io(io::Error::other("injected write failure")))
        } else {
            Ok(())
        }
    }
}

impl<S: JobStore> JobStore for FlakyStore<S> {
    fn enqueue(&self, job: NewJob) -> Result<Job, JobStoreError> {
        self.inner.enqueue(job)
    }

    fn get(&self, id: &JobId) -> Result<Option<Job>, JobStoreError> {
        self.inner.get(id)
    }

    fn list(&self, state: Option<JobState>) -> Result<Vec<Job>, JobStoreError> {
        self.inner.list(state)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        self.inner.stats()
    }

    fn sweep_due_retries(&self) -> Result<usize, JobStoreError> {
        self.inner.sweep_due_retries()
    }

    fn claim_next(&self, worker: &str) -> Result<Option<Job>, JobStoreError> {
        self.inner.claim_next(worker)
    }

    fn complete(&self, id: &JobId) -> Result<Job, JobStoreError> {
        Self::trip(&self.complete_failures)?;
        self.inner.complete(id)
    }

    fn increment_attempts(&self, id: &JobId) -> Result<AttemptCount, JobStoreError> {
        self.inner.increment_attempts(id)
    }

    fn reschedule_or_dead(
        &self,
        id: &JobId,
        error: &str,
        attempts: u32,
        max_retries: u32,
        policy: &RetryPolicy,
    ) -> Result<Job, JobStoreError> {
        self.inner
            .reschedule_or_dead(id, error, attempts, max_retries, policy)
    }

    fn retry_from_dead_letter(&self, id: &JobId) -> Result<Job, JobStoreError> {
        self.inner.retry_from_dead_letter(id)
    }

    fn record_run(&self, run: NewJobRun) -> Result<JobRun, JobStoreError> {
        Self::trip(&self.record_failures)?;
        self.inner.record_run(run)
    }

    fn recent_runs(&self, limit: usize) -> Result<Vec<JobRun>, JobStoreError> {
        self.inner.recent_runs(limit)
    }
}

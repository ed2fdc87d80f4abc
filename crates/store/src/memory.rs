//! In-memory job store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};

use jobq_core::{
    DomainError, Job, JobId, JobRun, JobState, JobStats, NewJob, NewJobRun, RetryDecision,
    RetryPolicy, Transition,
};

use crate::clock::{Clock, truncate_ms};
use crate::error::JobStoreError;
use crate::store::{AttemptCount, JobStore};

#[derive(Debug)]
struct Entry {
    /// Insertion order, the final FIFO tie-breaker.
    seq: u64,
    job: Job,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Entry>,
    runs: Vec<JobRun>,
    next_seq: u64,
}

/// Process-local store with the same semantics as the SQLite one.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
    clock: Clock,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `transition` to `id`, then let `update` adjust the other fields.
    fn transition(
        &self,
        id: &JobId,
        transition: Transition,
        update: impl FnOnce(&mut Job, DateTime<Utc>),
    ) -> Result<Job, JobStoreError> {
        let now = self.clock.now();
        let mut inner = self.write();
        let entry = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| JobStoreError::NotFound(id.clone()))?;
        let to = transition
            .apply(entry.job.state)
            .map_err(|e| JobStoreError::from_domain(id, e))?;
        entry.job.state = to;
        entry.job.updated_at = now;
        update(&mut entry.job, now);
        Ok(entry.job.clone())
    }
}

fn sweep(inner: &mut Inner, now: DateTime<Utc>) -> usize {
    let mut moved = 0;
    for entry in inner.jobs.values_mut() {
        if entry.job.is_due_for_retry(now) {
            entry.job.state = Transition::Sweep.to();
            entry.job.updated_at = now;
            moved += 1;
        }
    }
    moved
}

impl JobStore for InMemoryJobStore {
    fn enqueue(&self, mut new: NewJob) -> Result<Job, JobStoreError> {
        new.run_at = new.run_at.map(truncate_ms);
        let job = new.into_job(self.clock.now());
        let mut inner = self.write();
        if inner.jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.insert(
            job.id.clone(),
            Entry {
                seq,
                job: job.clone(),
            },
        );
        Ok(job)
    }

    fn get(&self, id: &JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read().jobs.get(id).map(|e| e.job.clone()))
    }

    fn list(&self, state: Option<JobState>) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.read();
        let mut entries: Vec<&Entry> = inner
            .jobs
            .values()
            .filter(|e| state.is_none_or(|s| e.job.state == s))
            .collect();
        entries.sort_by_key(|e| (e.job.created_at, e.seq));
        Ok(entries.into_iter().map(|e| e.job.clone()).collect())
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let inner = self.read();
        let mut stats = JobStats::default();
        for entry in inner.jobs.values() {
            stats.add(entry.job.state, 1);
        }
        stats.total_runs = inner.runs.len() as u64;
        Ok(stats)
    }

    fn sweep_due_retries(&self) -> Result<usize, JobStoreError> {
        let now = self.clock.now();
        Ok(sweep(&mut self.write(), now))
    }

    fn claim_next(&self, worker: &str) -> Result<Option<Job>, JobStoreError> {
        if worker.trim().is_empty() {
            return Err(DomainError::validation("worker id must not be empty").into());
        }
        let now = self.clock.now();
        let mut inner = self.write();
        sweep(&mut inner, now);

        let Some(entry) = inner
            .jobs
            .values_mut()
            .filter(|e| e.job.is_eligible(now))
            .min_by_key(|e| (e.job.priority, e.job.next_run_at, e.job.created_at, e.seq))
        else {
            return Ok(None);
        };
        entry.job.state = Transition::Claim.to();
        entry.job.worker = Some(worker.to_owned());
        entry.job.updated_at = now;
        Ok(Some(entry.job.clone()))
    }

    fn complete(&self, id: &JobId) -> Result<Job, JobStoreError> {
        self.transition(id, Transition::Complete, |job, _| job.worker = None)
    }

    fn increment_attempts(&self, id: &JobId) -> Result<AttemptCount, JobStoreError> {
        let now = self.clock.now();
        let mut inner = self.write();
        let entry = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| JobStoreError::NotFound(id.clone()))?;
        if entry.job.state != JobState::Processing {
            return Err(JobStoreError::InvalidTransition {
                id: id.clone(),
                transition: Transition::Fail,
                from: entry.job.state,
            });
        }
        entry.job.attempts = entry.job.attempts.saturating_add(1);
        entry.job.updated_at = now;
        Ok(AttemptCount {
            attempts: entry.job.attempts,
            max_retries: entry.job.max_retries,
        })
    }

    fn reschedule_or_dead(
        &self,
        id: &JobId,
        error: &str,
        attempts: u32,
        max_retries: u32,
        policy: &RetryPolicy,
    ) -> Result<Job, JobStoreError> {
        let decision = policy.decide(attempts, max_retries, self.clock.now());
        self.transition(id, decision.transition(), |job, _| {
            job.worker = None;
            job.last_error = Some(error.to_owned());
            if let RetryDecision::Retry { next_run_at } = decision {
                let next_run_at = truncate_ms(next_run_at);
                job.next_run_at = Some(
                    job.next_run_at
                        .map_or(next_run_at, |cur| cur.max(next_run_at)),
                );
            }
        })
    }

    fn retry_from_dead_letter(&self, id: &JobId) -> Result<Job, JobStoreError> {
        self.transition(id, Transition::Revive, |job, now| {
            job.attempts = 0;
            job.last_error = None;
            job.next_run_at = Some(now);
        })
    }

    fn record_run(&self, run: NewJobRun) -> Result<JobRun, JobStoreError> {
        let mut inner = self.write();
        let duration_ms = run.duration_ms();
        let recorded = JobRun {
            id: inner.runs.len() as i64 + 1,
            job_id: run.job_id,
            started_at: truncate_ms(run.started_at),
            finished_at: truncate_ms(run.finished_at),
            exit_code: run.exit_code,
            duration_ms,
            bytes_stdout: run.bytes_stdout,
            bytes_stderr: run.bytes_stderr,
        };
        inner.runs.push(recorded.clone());
        Ok(recorded)
    }

    fn recent_runs(&self, limit: usize) -> Result<Vec<JobRun>, JobStoreError> {
        Ok(self.read().runs.iter().rev().take(limit).cloned().collect())
    }
}

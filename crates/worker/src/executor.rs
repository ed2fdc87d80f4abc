//! Job executor: runs one claimed job's shell command and records the result.

use std::io::{self, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, warn};

use jobq_core::{Job, JobId, JobRun, JobState, NewJobRun, QueueConfig, RetryPolicy};
use jobq_store::{AttemptCount, Clock, JobStore, JobStoreError};

use crate::logs::{LogLayout, LogPaths};

/// Exit code recorded when a command exceeds its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code recorded when the command could not be run at all.
pub const INTERNAL_ERROR_EXIT_CODE: i32 = 1;

const WAIT_SLICE: Duration = Duration::from_millis(20);

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// Used when a job carries no timeout of its own.
    pub default_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for JobExecutorConfig {
    fn from(config: &QueueConfig) -> Self {
        Self {
            default_timeout: config.default_timeout(),
            retry_policy: config.retry_policy(),
        }
    }
}

impl JobExecutorConfig {
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

/// Failure to drive a job through the executor.
///
/// Problems with the command itself (non-zero exit, timeout, spawn failure)
/// are not errors; they become a failed run. Only store failures surface.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("job {job_id} is not processing (state {state})")]
    NotClaimed { job_id: JobId, state: JobState },

    /// The command ran but its result is not fully written back. `pending`
    /// can be handed to [`JobExecutor::finish`] again.
    #[error("result of job {job_id} not written back: {source}")]
    Unreported {
        job_id: JobId,
        pending: Box<PendingReport>,
        source: JobStoreError,
    },
}

impl ExecutionError {
    /// The unfinished report, if writing it back is worth another attempt.
    pub fn into_retryable(self) -> Option<PendingReport> {
        match self {
            Self::Unreported {
                pending, source, ..
            } if source.is_transient() => Some(*pending),
            _ => None,
        }
    }
}

/// Where a job ended up after one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Retrying {
        attempts: u32,
        next_run_at: Option<DateTime<Utc>>,
    },
    DeadLettered {
        attempts: u32,
    },
}

/// One finished execution: the recorded run plus the resulting transition.
#[derive(Debug, Clone)]
pub struct Execution {
    pub run: JobRun,
    pub outcome: Outcome,
}

impl Execution {
    pub fn succeeded(&self) -> bool {
        self.outcome == Outcome::Completed
    }
}

/// The result of a command that still has to reach the store.
///
/// Tracks which writes already landed so that finishing it again never
/// counts an attempt twice or repeats a transition.
#[derive(Debug, Clone)]
pub struct PendingReport {
    job_id: JobId,
    exit_code: i32,
    run: NewJobRun,
    attempts: Option<AttemptCount>,
    outcome: Option<Outcome>,
}

impl PendingReport {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Whether the job has already left `processing`.
    pub fn transitioned(&self) -> bool {
        self.outcome.is_some()
    }
}

/// How the child process finished.
#[derive(Debug)]
enum Exit {
    Code(i32),
    TimedOut,
}

/// Executes claimed jobs against a store.
pub struct JobExecutor<S: JobStore> {
    store: S,
    logs: LogLayout,
    config: JobExecutorConfig,
    clock: Clock,
}

impl<S: JobStore> JobExecutor<S> {
    pub fn new(store: S, logs: LogLayout, config: JobExecutorConfig) -> Self {
        Self {
            store,
            logs,
            config,
            clock: Clock::system(),
        }
    }

    /// Stamp runs with `clock`, normally the one the store was built with.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn logs(&self) -> &LogLayout {
        &self.logs
    }

    pub fn config(&self) -> &JobExecutorConfig {
        &self.config
    }

    /// Run a job previously returned by `claim_next`, apply the resulting
    /// transition, and record a [`JobRun`].
    pub fn execute(&self, job: &Job) -> Result<Execution, ExecutionError> {
        if job.state != JobState::Processing {
            return Err(ExecutionError::NotClaimed {
                job_id: job.id.clone(),
                state: job.state,
            });
        }

        let timeout = job.effective_timeout(self.config.default_timeout);
        let paths = self.logs.log_paths_for(&job.id);
        let (stdout_before, stderr_before) = paths.sizes();

        let started_at = self.clock.now();
        let started = Instant::now();
        let exit_code = self.run_command(job, &paths, timeout);
        let elapsed = TimeDelta::from_std(started.elapsed()).unwrap_or(TimeDelta::MAX);
        let finished_at = started_at.checked_add_signed(elapsed).unwrap_or(started_at);

        let (stdout_after, stderr_after) = paths.sizes();
        self.finish(PendingReport {
            job_id: job.id.clone(),
            exit_code,
            run: NewJobRun {
                job_id: job.id.clone(),
                started_at,
                finished_at,
                exit_code: Some(exit_code),
                bytes_stdout: stdout_after.saturating_sub(stdout_before),
                bytes_stderr: stderr_after.saturating_sub(stderr_before),
            },
            attempts: None,
            outcome: None,
        })
    }

    /// Write a command result back: the state transition first, so the job
    /// never stays `processing` because of a failed history insert, then the
    /// run record. Steps that already landed are skipped.
    pub fn finish(&self, mut pending: PendingReport) -> Result<Execution, ExecutionError> {
        let outcome = match pending.outcome.clone() {
            Some(outcome) => outcome,
            None => match self.apply_outcome(&mut pending) {
                Ok(outcome) => {
                    pending.outcome = Some(outcome.clone());
                    outcome
                }
                Err(e) => return Err(unreported(pending, e)),
            },
        };

        match self.store.record_run(pending.run.clone()) {
            Ok(run) => Ok(Execution { run, outcome }),
            Err(e) => {
                warn!(job_id = %pending.job_id, error = %e, "failed to record run");
                Err(unreported(pending, e))
            }
        }
    }

    fn apply_outcome(&self, pending: &mut PendingReport) -> Result<Outcome, JobStoreError> {
        let id = &pending.job_id;
        let exit_code = pending.exit_code;
        if exit_code == 0 {
            self.store.complete(id)?;
            info!(job_id = %id, duration_ms = pending.run.duration_ms(), "job completed");
            return Ok(Outcome::Completed);
        }

        let counts = match pending.attempts {
            Some(counts) => counts,
            None => {
                let counts = self.store.increment_attempts(id)?;
                pending.attempts = Some(counts);
                counts
            }
        };
        let updated = self.store.reschedule_or_dead(
            id,
            &format!("exit:{exit_code}"),
            counts.attempts,
            counts.max_retries,
            &self.config.retry_policy,
        )?;
        if updated.state == JobState::Dead {
            warn!(
                job_id = %id,
                exit_code,
                attempts = counts.attempts,
                "job dead-lettered"
            );
            Ok(Outcome::DeadLettered {
                attempts: counts.attempts,
            })
        } else {
            warn!(
                job_id = %id,
                exit_code,
                attempts = counts.attempts,
                next_run_at = ?updated.next_run_at,
                "job failed, retry scheduled"
            );
            Ok(Outcome::Retrying {
                attempts: counts.attempts,
                next_run_at: updated.next_run_at,
            })
        }
    }

    /// Run the command to an exit code. Never fails: timeouts and internal
    /// errors are written to the job's stderr log and mapped to fixed codes.
    fn run_command(&self, job: &Job, paths: &LogPaths, timeout: Duration) -> i32 {
        match self.spawn_and_wait(&job.command, paths, timeout) {
            Ok(Exit::Code(code)) => code,
            Ok(Exit::TimedOut) => {
                warn!(job_id = %job.id, timeout_secs = timeout.as_secs(), "job timed out");
                append_marker(paths, &format!("timeout after {}s\n", timeout.as_secs()));
                TIMEOUT_EXIT_CODE
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "job could not be executed");
                append_marker(paths, &format!("exception: {e}\n"));
                INTERNAL_ERROR_EXIT_CODE
            }
        }
    }

    fn spawn_and_wait(&self, command: &str, paths: &LogPaths, timeout: Duration) -> io::Result<Exit> {
        self.logs.ensure_dir()?;
        let stdout = paths.open_stdout()?;
        let stderr = paths.open_stderr()?;

        let mut child = shell(command)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()?;
        debug!(pid = child.id(), command, "spawned job command");

        // A timeout too large for the platform clock means no deadline.
        wait_with_deadline(&mut child, Instant::now().checked_add(timeout))
    }
}

fn unreported(pending: PendingReport, source: JobStoreError) -> ExecutionError {
    ExecutionError::Unreported {
        job_id: pending.job_id.clone(),
        pending: Box::new(pending),
        source,
    }
}

/// Poll the child until it exits or the deadline passes, killing it then.
fn wait_with_deadline(child: &mut Child, deadline: Option<Instant>) -> io::Result<Exit> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Exit::Code(exit_code(status)));
        }
        let now = Instant::now();
        let slice = match deadline {
            Some(deadline) if now >= deadline => {
                // The child may exit between try_wait and kill.
                if let Err(e) = child.kill() {
                    if e.kind() != io::ErrorKind::InvalidInput {
                        return Err(e);
                    }
                }
                let _ = child.wait()?;
                return Ok(Exit::TimedOut);
            }
            Some(deadline) => WAIT_SLICE.min(deadline - now),
            None => WAIT_SLICE,
        };
        thread::sleep(slice);
    }
}

#[cfg(unix)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(INTERNAL_ERROR_EXIT_CODE)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(INTERNAL_ERROR_EXIT_CODE)
}

/// Best effort: the run is recorded even if the marker cannot be written.
fn append_marker(paths: &LogPaths, line: &str) {
    let written = paths
        .open_stderr()
        .and_then(|mut f| f.write_all(line.as_bytes()));
    if let Err(e) = written {
        warn!(path = %paths.stderr.display(), error = %e, "failed to write stderr marker");
    }
}

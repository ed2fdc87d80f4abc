//! Worker pool: N OS threads, each a claim/execute/sleep loop.

use std::io;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use jobq_core::QueueConfig;
use jobq_store::JobStore;

use crate::executor::{Execution, ExecutionError, JobExecutor, Outcome, PendingReport};

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Sleep between polls when nothing is eligible.
    pub poll_interval: Duration,
    /// How long `stop` waits for each worker to finish its current job.
    pub stop_timeout: Duration,
    /// Worker names are `<prefix>-<index>-<pid>`.
    pub name_prefix: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for WorkerPoolConfig {
    fn from(config: &QueueConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            stop_timeout: Duration::from_secs(10),
            name_prefix: "worker".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool is already running")]
    AlreadyRunning,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    /// Jobs whose result could not be written back to the store.
    pub jobs_errored: u64,
    pub current_running: usize,
}

impl WorkerStats {
    fn merge(&mut self, other: &WorkerStats) {
        self.jobs_processed += other.jobs_processed;
        self.jobs_succeeded += other.jobs_succeeded;
        self.jobs_failed += other.jobs_failed;
        self.jobs_dead_lettered += other.jobs_dead_lettered;
        self.jobs_errored += other.jobs_errored;
        self.current_running += other.current_running;
    }
}

/// Stop flag shared by all workers of a pool. Sleeping workers wake as soon
/// as it is raised.
#[derive(Debug, Default)]
struct StopSignal {
    raised: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    fn raise(&self) {
        *self.raised.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cond.notify_all();
    }

    fn reset(&self) {
        *self.raised.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }

    fn is_raised(&self) -> bool {
        *self.raised.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep up to `timeout`; returns early (with `true`) once raised.
    fn wait(&self, timeout: Duration) -> bool {
        let guard = self.raised.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |raised| !*raised)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

#[derive(Debug)]
struct WorkerHandle {
    name: String,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    fn is_alive(&self) -> bool {
        self.join.as_ref().is_some_and(|j| !j.is_finished())
    }
}

/// Runs workers against a shared [`JobExecutor`].
pub struct WorkerPool<S: JobStore> {
    executor: Arc<JobExecutor<S>>,
    config: WorkerPoolConfig,
    signal: Arc<StopSignal>,
    workers: Vec<WorkerHandle>,
}

impl<S: JobStore + 'static> WorkerPool<S> {
    pub fn new(executor: JobExecutor<S>, config: WorkerPoolConfig) -> Self {
        Self {
            executor: Arc::new(executor),
            config,
            signal: Arc::new(StopSignal::default()),
            workers: Vec::new(),
        }
    }

    /// Launch `count` workers.
    pub fn start(&mut self, count: usize) -> Result<(), PoolError> {
        if self.is_running() {
            return Err(PoolError::AlreadyRunning);
        }
        self.workers.clear();
        self.signal.reset();

        let pid = std::process::id();
        for i in 0..count {
            let name = format!("{}-{i}-{pid}", self.config.name_prefix);
            let stats = Arc::new(Mutex::new(WorkerStats::default()));
            let ctx = WorkerContext {
                name: name.clone(),
                executor: self.executor.clone(),
                signal: self.signal.clone(),
                stats: stats.clone(),
                poll_interval: self.config.poll_interval,
            };
            let join = match thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(ctx))
            {
                Ok(join) => join,
                Err(e) => {
                    self.stop();
                    return Err(e.into());
                }
            };
            self.workers.push(WorkerHandle {
                name,
                join: Some(join),
                stats,
            });
        }
        info!(count, "worker pool started");
        Ok(())
    }

    /// Signal every worker to stop and wait (bounded) for them to finish
    /// their current job. Returns the names of workers still running when
    /// the wait gave up.
    pub fn stop(&mut self) -> Vec<String> {
        self.signal.raise();
        let mut stragglers = Vec::new();
        for worker in &mut self.workers {
            let deadline = Instant::now() + self.config.stop_timeout;
            while worker.is_alive() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if worker.is_alive() {
                warn!(worker = %worker.name, "worker did not stop in time");
                stragglers.push(worker.name.clone());
            } else if let Some(join) = worker.join.take() {
                if join.join().is_err() {
                    error!(worker = %worker.name, "worker thread panicked");
                }
            }
        }
        info!(stragglers = stragglers.len(), "worker pool stopped");
        stragglers
    }

    /// Whether any worker thread is still alive.
    pub fn is_running(&self) -> bool {
        self.workers.iter().any(WorkerHandle::is_alive)
    }

    pub fn worker_names(&self) -> Vec<String> {
        self.workers.iter().map(|w| w.name.clone()).collect()
    }

    /// Counters summed over all workers.
    pub fn stats(&self) -> WorkerStats {
        let mut total = WorkerStats::default();
        for worker in &self.workers {
            total.merge(&worker.stats.lock().unwrap_or_else(PoisonError::into_inner));
        }
        total
    }

    pub fn executor(&self) -> &JobExecutor<S> {
        &self.executor
    }
}

struct WorkerContext<S: JobStore> {
    name: String,
    executor: Arc<JobExecutor<S>>,
    signal: Arc<StopSignal>,
    stats: Arc<Mutex<WorkerStats>>,
    poll_interval: Duration,
}

fn worker_loop<S: JobStore>(ctx: WorkerContext<S>) {
    info!(worker = %ctx.name, "worker started");
    // A finished job whose result the store has not taken yet. No new job is
    // claimed until it is written back.
    let mut pending: Option<PendingReport> = None;

    while !ctx.signal.is_raised() {
        if let Some(report) = pending.take() {
            pending = ctx.settle(ctx.executor.finish(report));
            if pending.is_some() {
                ctx.signal.wait(ctx.poll_interval);
            }
            continue;
        }

        match ctx.executor.store().claim_next(&ctx.name) {
            Ok(Some(job)) => {
                debug!(worker = %ctx.name, job_id = %job.id, "executing job");
                update(&ctx.stats, |s| s.current_running += 1);
                let result = ctx.executor.execute(&job);
                update(&ctx.stats, |s| {
                    s.current_running = s.current_running.saturating_sub(1)
                });
                pending = ctx.settle(result);
            }
            Ok(None) => {
                ctx.signal.wait(ctx.poll_interval);
            }
            Err(e) => {
                error!(worker = %ctx.name, error = %e, "failed to claim job");
                ctx.signal.wait(ctx.poll_interval);
            }
        }
    }

    if let Some(report) = pending {
        if let Some(report) = ctx.settle(ctx.executor.finish(report)) {
            error!(
                worker = %ctx.name,
                job_id = %report.job_id(),
                transitioned = report.transitioned(),
                "stopping with an unwritten job result"
            );
            update(&ctx.stats, |s| {
                s.jobs_processed += 1;
                s.jobs_errored += 1;
            });
        }
    }

    info!(worker = %ctx.name, "worker stopped");
}

impl<S: JobStore> WorkerContext<S> {
    /// Count a finished execution. Returns the report to retry when the
    /// store failed transiently.
    fn settle(&self, result: Result<Execution, ExecutionError>) -> Option<PendingReport> {
        let err = match result {
            Ok(execution) => {
                update(&self.stats, |s| {
                    s.jobs_processed += 1;
                    match execution.outcome {
                        Outcome::Completed => s.jobs_succeeded += 1,
                        Outcome::Retrying { .. } => s.jobs_failed += 1,
                        Outcome::DeadLettered { .. } => {
                            s.jobs_failed += 1;
                            s.jobs_dead_lettered += 1;
                        }
                    }
                });
                return None;
            }
            Err(err) => err,
        };

        error!(worker = %self.name, error = %err, "job result not written back");
        let retry = err.into_retryable();
        if retry.is_none() {
            update(&self.stats, |s| {
                s.jobs_processed += 1;
                s.jobs_errored += 1;
            });
        }
        retry
    }
}

fn update(stats: &Mutex<WorkerStats>, f: impl FnOnce(&mut WorkerStats)) {
    f(&mut stats.lock().unwrap_or_else(PoisonError::into_inner));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_signal_wakes_sleepers() {
        let signal = Arc::new(StopSignal::default());
        let sleeper = {
            let signal = signal.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let raised = signal.wait(Duration::from_secs(30));
                (raised, started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(50));
        signal.raise();
        let (raised, slept) = sleeper.join().unwrap();
        assert!(raised);
        assert!(slept < Duration::from_secs(5));
    }

    #[test]
    fn stop_signal_times_out_when_not_raised() {
        let signal = StopSignal::default();
        assert!(!signal.wait(Duration::from_millis(20)));
        signal.raise();
        assert!(signal.is_raised());
        signal.reset();
        assert!(!signal.is_raised());
    }

    #[test]
    fn stats_merge_sums_counters() {
        let mut total = WorkerStats::default();
        total.merge(&WorkerStats {
            jobs_processed: 3,
            jobs_succeeded: 2,
            jobs_failed: 1,
            jobs_dead_lettered: 1,
            jobs_errored: 2,
            current_running: 1,
        });
        total.merge(&WorkerStats {
            jobs_processed: 1,
            jobs_succeeded: 1,
            ..Default::default()
        });
        assert_eq!(total.jobs_processed, 4);
        assert_eq!(total.jobs_succeeded, 3);
        assert_eq!(total.jobs_dead_lettered, 1);
        assert_eq!(total.jobs_errored, 2);
        assert_eq!(total.current_running, 1);
    }

    #[cfg(unix)]
    #[test]
    fn worker_retries_unwritten_results_before_claiming_again() {
        use jobq_core::{EnqueueRequest, JobState};
        use jobq_store::InMemoryJobStore;

        use crate::executor::JobExecutorConfig;
        use crate::logs::LogLayout;
        use crate::testing::FlakyStore;

        let dir = tempfile::tempdir().unwrap();
        let inner = InMemoryJobStore::arc();
        for id in ["a", "b"] {
            let job = EnqueueRequest::new(id, "true")
                .validate(&QueueConfig::default())
                .unwrap();
            inner.enqueue(job).unwrap();
        }
        let executor = JobExecutor::new(
            FlakyStore::new(inner.clone())
                .failing_record_run(2)
                .failing_complete(1),
            LogLayout::new(dir.path().join("logs")),
            JobExecutorConfig::default(),
        );
        let mut pool = WorkerPool::new(
            executor,
            WorkerPoolConfig::default().with_poll_interval(Duration::from_millis(10)),
        );
        pool.start(1).unwrap();

        let deadline = Instant::now() + Duration::from_secs(15);
        while inner.stats().unwrap().total_runs < 2 {
            assert!(Instant::now() < deadline, "results never written back");
            thread::sleep(Duration::from_millis(10));
        }
        assert!(pool.stop().is_empty());

        let stats = inner.stats().unwrap();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.processing, 0);
        assert_eq!(stats.total_runs, 2);
        assert_eq!(
            inner.list(Some(JobState::Completed)).unwrap().len(),
            2
        );

        let worker = pool.stats();
        assert_eq!(worker.jobs_processed, 2);
        assert_eq!(worker.jobs_succeeded, 2);
        assert_eq!(worker.jobs_errored, 0);
    }
}

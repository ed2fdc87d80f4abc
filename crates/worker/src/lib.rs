//! `jobq-worker`: executes claimed jobs as shell commands.
//!
//! [`JobExecutor`] runs one job to a recorded outcome; [`WorkerPool`] drives
//! executors from a set of polling threads.

pub mod executor;
pub mod logs;
pub mod pool;

#[cfg(test)]
mod testing;

pub use executor::{
    Execution, ExecutionError, INTERNAL_ERROR_EXIT_CODE, JobExecutor, JobExecutorConfig, Outcome,
    PendingReport, TIMEOUT_EXIT_CODE,
};
pub use logs::{LogLayout, LogPaths};
pub use pool::{PoolError, WorkerPool, WorkerPoolConfig, WorkerStats};

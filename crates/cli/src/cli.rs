use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "jobq")]
#[command(about = "Durable shell-command job queue with retries and a dead-letter queue.")]
pub struct Cli {
    /// Directory holding jobq.db and logs/ (default: <platform data dir>/jobq).
    #[arg(long, global = true, env = "JOBQ_HOME")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Enqueue a job from JSON, e.g. '{"id":"job1","command":"echo hi"}'.
    Enqueue {
        /// Job object; only "command" is required.
        job: String,

        /// Lower runs first (default: 100).
        #[arg(long)]
        priority: Option<i64>,

        /// Earliest start, RFC 3339 (e.g. 2025-11-04T10:30:00Z).
        #[arg(long)]
        run_at: Option<DateTime<Utc>>,

        /// Per-job timeout in seconds.
        #[arg(long = "timeout")]
        timeout_secs: Option<u64>,

        /// Attempts before the job is dead-lettered.
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// Worker management.
    Worker {
        #[command(subcommand)]
        command: WorkerCommand,
    },
    /// Job counts per state plus run totals.
    Status,
    /// List jobs, optionally filtered by state.
    List {
        /// pending | processing | completed | failed | dead
        #[arg(long)]
        state: Option<String>,
    },
    /// Dead-letter queue operations.
    Dlq {
        #[command(subcommand)]
        command: DlqCommand,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Show the log file paths of a job.
    Logs {
        job_id: String,
    },
    /// Serve the read-only web dashboard.
    Web {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
}

#[derive(Debug, Subcommand)]
pub enum WorkerCommand {
    /// Run workers in the foreground until Ctrl-C.
    Start {
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
}

#[derive(Debug, Subcommand)]
pub enum DlqCommand {
    /// List dead-lettered jobs.
    List,
    /// Move a dead job back to pending with its attempts reset.
    Retry { job_id: String },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    Set { key: String, value: String },
    Get { key: String },
    Show,
}

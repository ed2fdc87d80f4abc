//! SQLite schema and connection setup shared by the job and config stores.

use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Timestamps are Unix milliseconds (UTC). `CHECK` constraints mirror the
/// state-machine invariants so a bad write fails loudly instead of persisting.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id           TEXT PRIMARY KEY,
    command      TEXT NOT NULL,
    state        TEXT NOT NULL
                 CHECK (state IN ('pending', 'processing', 'completed', 'failed', 'dead')),
    attempts     INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
    max_retries  INTEGER NOT NULL DEFAULT 3 CHECK (max_retries >= 0),
    priority     INTEGER NOT NULL DEFAULT 100,
    created_at   INTEGER NOT NULL,
    updated_at   INTEGER NOT NULL,
    run_at       INTEGER,
    next_run_at  INTEGER,
    timeout_secs INTEGER CHECK (timeout_secs IS NULL OR timeout_secs > 0),
    worker       TEXT,
    last_error   TEXT,
    CHECK ((state = 'processing') = (worker IS NOT NULL))
);

CREATE INDEX IF NOT EXISTS idx_jobs_state_sched
    ON jobs(state, next_run_at, priority, created_at);

CREATE TABLE IF NOT EXISTS job_runs (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id       TEXT NOT NULL,
    started_at   INTEGER NOT NULL,
    finished_at  INTEGER NOT NULL,
    exit_code    INTEGER,
    duration_ms  INTEGER NOT NULL,
    bytes_stdout INTEGER NOT NULL,
    bytes_stderr INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_job_runs_job ON job_runs(job_id);

CREATE TABLE IF NOT EXISTS config (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Open a connection configured for multi-process use.
pub(crate) fn connect(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

/// Create parent directories, switch to WAL, and install the schema.
pub(crate) fn initialize(path: &Path) -> Result<(), InitError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let conn = connect(path)?;
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum InitError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

impl From<InitError> for crate::error::JobStoreError {
    fn from(err: InitError) -> Self {
        match err {
            InitError::Io(e) => Self::Io(e),
            InitError::Sqlite(e) => Self::Sqlite(e),
        }
    }
}

impl From<InitError> for crate::error::ConfigError {
    fn from(err: InitError) -> Self {
        match err {
            InitError::Io(e) => Self::Io(e),
            InitError::Sqlite(e) => Self::Sqlite(e),
        }
    }
}

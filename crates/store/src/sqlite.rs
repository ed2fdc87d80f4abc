//! SQLite-backed job store.
//!
//! Each operation opens its own connection, so worker threads and separate
//! processes share nothing but the database file. Correctness of the claim
//! relies on SQLite's write lock: the sweep and the claiming
//! `UPDATE … RETURNING` run inside one `BEGIN IMMEDIATE` transaction.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{
    Connection, ErrorCode, OptionalExtension, Row, ToSql, TransactionBehavior, params,
};
use tracing::{debug, info};

use jobq_core::{
    DomainError, Job, JobId, JobRun, JobState, JobStats, NewJob, NewJobRun, RetryDecision,
    RetryPolicy, Transition,
};

use crate::clock::{Clock, truncate_ms};
use crate::error::JobStoreError;
use crate::schema;
use crate::store::{AttemptCount, JobStore};

const JOB_COLUMNS: &str = "id, command, state, attempts, max_retries, priority, created_at, \
     updated_at, run_at, next_run_at, timeout_secs, worker, last_error";

const RUN_COLUMNS: &str =
    "id, job_id, started_at, finished_at, exit_code, duration_ms, bytes_stdout, bytes_stderr";

const SWEEP_SQL: &str = r#"
UPDATE jobs
SET state = ?1, updated_at = ?2
WHERE state = ?3 AND (next_run_at IS NULL OR next_run_at <= ?2)
"#;

/// Select-and-update in one statement: the subquery picks the head of the
/// queue, the outer `state = ?4` re-check makes a lost race a no-op.
const CLAIM_SQL: &str = r#"
UPDATE jobs
SET state = ?1, worker = ?2, updated_at = ?3
WHERE id = (
    SELECT id FROM jobs
    WHERE state = ?4 AND (next_run_at IS NULL OR next_run_at <= ?3)
    ORDER BY priority ASC, next_run_at ASC, created_at ASC, rowid ASC
    LIMIT 1
)
AND state = ?4
RETURNING id, command, state, attempts, max_retries, priority, created_at,
          updated_at, run_at, next_run_at, timeout_secs, worker, last_error
"#;

/// Durable job store over a single SQLite file.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    path: PathBuf,
    clock: Clock,
}

impl SqliteJobStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JobStoreError> {
        let path = path.as_ref().to_path_buf();
        schema::initialize(&path)?;
        Ok(Self {
            path,
            clock: Clock::system(),
        })
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<Connection, JobStoreError> {
        Ok(schema::connect(&self.path)?)
    }

    /// Apply `transition` to one row, guarded by its source state.
    ///
    /// `assignments` extends the `SET` clause; its placeholders start at `?5`
    /// and are bound from `extra`.
    fn transition(
        &self,
        conn: &Connection,
        id: &JobId,
        transition: Transition,
        assignments: &str,
        extra: &[&dyn ToSql],
    ) -> Result<Job, JobStoreError> {
        let now_ms = self.clock.now().timestamp_millis();
        let to = transition.to().as_str();
        let from = transition.from().as_str();
        let id_str = id.as_str();

        let sql = format!(
            "UPDATE jobs SET state = ?1, updated_at = ?2{assignments} \
             WHERE id = ?3 AND state = ?4 RETURNING {JOB_COLUMNS}"
        );
        let mut bound: Vec<&dyn ToSql> = vec![&to, &now_ms, &id_str, &from];
        bound.extend_from_slice(extra);

        match conn
            .query_row(&sql, bound.as_slice(), read_job)
            .optional()?
        {
            Some(job) => Ok(job),
            None => Err(diagnose(conn, id, transition)?),
        }
    }
}

/// Explain why a guarded update touched no row.
fn diagnose(
    conn: &Connection,
    id: &JobId,
    transition: Transition,
) -> Result<JobStoreError, JobStoreError> {
    let state: Option<String> = conn
        .query_row(
            "SELECT state FROM jobs WHERE id = ?1",
            params![id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    let Some(state) = state else {
        return Ok(JobStoreError::NotFound(id.clone()));
    };
    let from: JobState = state.parse()?;
    Ok(JobStoreError::InvalidTransition {
        id: id.clone(),
        transition,
        from,
    })
}

fn sweep(conn: &Connection, now_ms: i64) -> rusqlite::Result<usize> {
    conn.execute(
        SWEEP_SQL,
        params![
            Transition::Sweep.to().as_str(),
            now_ms,
            Transition::Sweep.from().as_str()
        ],
    )
}

impl JobStore for SqliteJobStore {
    fn enqueue(&self, mut new: NewJob) -> Result<Job, JobStoreError> {
        new.run_at = new.run_at.map(truncate_ms);
        let job = new.into_job(self.clock.now());
        let conn = self.conn()?;

        let inserted = conn.execute(
            &format!(
                "INSERT INTO jobs ({JOB_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                job.id.as_str(),
                job.command,
                job.state.as_str(),
                i64::from(job.attempts),
                i64::from(job.max_retries),
                job.priority,
                job.created_at.timestamp_millis(),
                job.updated_at.timestamp_millis(),
                job.run_at.map(|t| t.timestamp_millis()),
                job.next_run_at.map(|t| t.timestamp_millis()),
                job.timeout_secs.map(to_i64),
                job.worker,
                job.last_error,
            ],
        );
        match inserted {
            Ok(_) => {
                info!(job_id = %job.id, priority = job.priority, "job enqueued");
                Ok(job)
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation
                    && e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
            {
                Err(JobStoreError::AlreadyExists(job.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn get(&self, id: &JobId) -> Result<Option<Job>, JobStoreError> {
        let conn = self.conn()?;
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.as_str()],
                read_job,
            )
            .optional()?;
        Ok(job)
    }

    fn list(&self, state: Option<JobState>) -> Result<Vec<Job>, JobStoreError> {
        let conn = self.conn()?;
        let jobs = match state {
            Some(state) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE state = ?1 \
                     ORDER BY created_at ASC, rowid ASC"
                ))?;
                let rows = stmt.query_map(params![state.as_str()], read_job)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at ASC, rowid ASC"
                ))?;
                let rows = stmt.query_map([], read_job)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(jobs)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut stats = JobStats::default();
        {
            let mut stmt = tx.prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let state: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                stats.add(state.parse()?, count.max(0) as u64);
            }
        }
        let runs: i64 = tx.query_row("SELECT COUNT(*) FROM job_runs", [], |row| row.get(0))?;
        stats.total_runs = runs.max(0) as u64;
        tx.commit()?;
        Ok(stats)
    }

    fn sweep_due_retries(&self) -> Result<usize, JobStoreError> {
        let conn = self.conn()?;
        let moved = sweep(&conn, self.clock.now().timestamp_millis())?;
        if moved > 0 {
            debug!(moved, "due retries moved back to pending");
        }
        Ok(moved)
    }

    fn claim_next(&self, worker: &str) -> Result<Option<Job>, JobStoreError> {
        if worker.trim().is_empty() {
            return Err(DomainError::validation("worker id must not be empty").into());
        }
        let mut conn = self.conn()?;
        let now_ms = self.clock.now().timestamp_millis();

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let moved = sweep(&tx, now_ms)?;
        let claimed = tx
            .query_row(
                CLAIM_SQL,
                params![
                    Transition::Claim.to().as_str(),
                    worker,
                    now_ms,
                    Transition::Claim.from().as_str()
                ],
                read_job,
            )
            .optional()?;
        tx.commit()?;

        if moved > 0 {
            debug!(moved, "due retries moved back to pending");
        }
        if let Some(job) = &claimed {
            debug!(worker, job_id = %job.id, attempts = job.attempts, "claimed job");
        }
        Ok(claimed)
    }

    fn complete(&self, id: &JobId) -> Result<Job, JobStoreError> {
        let conn = self.conn()?;
        self.transition(&conn, id, Transition::Complete, ", worker = NULL", &[])
    }

    fn increment_attempts(&self, id: &JobId) -> Result<AttemptCount, JobStoreError> {
        let conn = self.conn()?;
        let now_ms = self.clock.now().timestamp_millis();
        let counts: Option<(i64, i64)> = conn
            .query_row(
                "UPDATE jobs SET attempts = attempts + 1, updated_at = ?1 \
                 WHERE id = ?2 AND state = ?3 RETURNING attempts, max_retries",
                params![now_ms, id.as_str(), JobState::Processing.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match counts {
            Some((attempts, max_retries)) => Ok(AttemptCount {
                attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
                max_retries: u32::try_from(max_retries).unwrap_or(u32::MAX),
            }),
            None => Err(diagnose(&conn, id, Transition::Fail)?),
        }
    }

    fn reschedule_or_dead(
        &self,
        id: &JobId,
        error: &str,
        attempts: u32,
        max_retries: u32,
        policy: &RetryPolicy,
    ) -> Result<Job, JobStoreError> {
        let conn = self.conn()?;
        match policy.decide(attempts, max_retries, self.clock.now()) {
            RetryDecision::Retry { next_run_at } => {
                let next_ms = next_run_at.timestamp_millis();
                self.transition(
                    &conn,
                    id,
                    Transition::Fail,
                    ", worker = NULL, last_error = ?5, \
                     next_run_at = MAX(COALESCE(next_run_at, ?6), ?6)",
                    &[&error as &dyn ToSql, &next_ms],
                )
            }
            RetryDecision::DeadLetter => self.transition(
                &conn,
                id,
                Transition::DeadLetter,
                ", worker = NULL, last_error = ?5",
                &[&error as &dyn ToSql],
            ),
        }
    }

    fn retry_from_dead_letter(&self, id: &JobId) -> Result<Job, JobStoreError> {
        let conn = self.conn()?;
        let job = self.transition(
            &conn,
            id,
            Transition::Revive,
            ", attempts = 0, last_error = NULL, next_run_at = ?2",
            &[],
        )?;
        info!(job_id = %id, "dead-lettered job requeued");
        Ok(job)
    }

    fn record_run(&self, run: NewJobRun) -> Result<JobRun, JobStoreError> {
        let conn = self.conn()?;
        let duration_ms = run.duration_ms();
        conn.execute(
            "INSERT INTO job_runs \
             (job_id, started_at, finished_at, exit_code, duration_ms, bytes_stdout, bytes_stderr) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run.job_id.as_str(),
                run.started_at.timestamp_millis(),
                run.finished_at.timestamp_millis(),
                run.exit_code,
                to_i64(duration_ms),
                to_i64(run.bytes_stdout),
                to_i64(run.bytes_stderr),
            ],
        )?;
        Ok(JobRun {
            id: conn.last_insert_rowid(),
            job_id: run.job_id,
            started_at: truncate_ms(run.started_at),
            finished_at: truncate_ms(run.finished_at),
            exit_code: run.exit_code,
            duration_ms,
            bytes_stdout: run.bytes_stdout,
            bytes_stderr: run.bytes_stderr,
        })
    }

    fn recent_runs(&self, limit: usize) -> Result<Vec<JobRun>, JobStoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM job_runs ORDER BY id DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![to_i64(limit as u64)], read_run)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn conversion_err<E>(idx: usize, ty: Type, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(err))
}

fn get_u32(row: &Row<'_>, idx: usize) -> rusqlite::Result<u32> {
    let raw: i64 = row.get(idx)?;
    u32::try_from(raw).map_err(|e| conversion_err(idx, Type::Integer, e))
}

fn get_u64(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let raw: i64 = row.get(idx)?;
    u64::try_from(raw).map_err(|e| conversion_err(idx, Type::Integer, e))
}

fn ms_to_dt(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            format!("timestamp out of range: {ms}").into(),
        )
    })
}

fn get_dt(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    ms_to_dt(idx, row.get(idx)?)
}

fn get_opt_dt(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<i64>>(idx)?
        .map(|ms| ms_to_dt(idx, ms))
        .transpose()
}

fn get_job_id(row: &Row<'_>, idx: usize) -> rusqlite::Result<JobId> {
    let raw: String = row.get(idx)?;
    JobId::new(raw).map_err(|e| conversion_err(idx, Type::Text, e))
}

fn read_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let state: String = row.get(2)?;
    Ok(Job {
        id: get_job_id(row, 0)?,
        command: row.get(1)?,
        state: state
            .parse()
            .map_err(|e| conversion_err(2, Type::Text, e))?,
        attempts: get_u32(row, 3)?,
        max_retries: get_u32(row, 4)?,
        priority: row.get(5)?,
        created_at: get_dt(row, 6)?,
        updated_at: get_dt(row, 7)?,
        run_at: get_opt_dt(row, 8)?,
        next_run_at: get_opt_dt(row, 9)?,
        timeout_secs: row
            .get::<_, Option<i64>>(10)?
            .map(|secs| u64::try_from(secs).map_err(|e| conversion_err(10, Type::Integer, e)))
            .transpose()?,
        worker: row.get(11)?,
        last_error: row.get(12)?,
    })
}

fn read_run(row: &Row<'_>) -> rusqlite::Result<JobRun> {
    Ok(JobRun {
        id: row.get(0)?,
        job_id: get_job_id(row, 1)?,
        started_at: get_dt(row, 2)?,
        finished_at: get_dt(row, 3)?,
        exit_code: row.get(4)?,
        duration_ms: get_u64(row, 5)?,
        bytes_stdout: get_u64(row, 6)?,
        bytes_stderr: get_u64(row, 7)?,
    })
}

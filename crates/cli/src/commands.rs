//! Subcommand implementations. Each returns a value the binary prints as JSON.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::info;

use jobq_core::config::KNOWN_KEYS;
use jobq_core::{DomainError, EnqueueRequest, Job, JobId, JobState, JobStats, QueueConfig};
use jobq_store::{ConfigError, ConfigStore, JobStore, JobStoreError, SqliteJobStore};
use jobq_worker::{JobExecutor, JobExecutorConfig, LogLayout, WorkerPool, WorkerPoolConfig};

use crate::paths::DataDir;

/// Exit status for rejected input.
pub const EXIT_INVALID_INPUT: u8 = 2;

/// Open stores for one data directory.
#[derive(Debug, Clone)]
pub struct Context {
    data_dir: DataDir,
    store: SqliteJobStore,
    config: ConfigStore,
}

impl Context {
    pub fn open(data_dir: DataDir) -> anyhow::Result<Self> {
        let db = data_dir.db_path();
        let config = ConfigStore::open(&db)
            .with_context(|| format!("failed to open config at {}", db.display()))?;
        let store = SqliteJobStore::open(&db)
            .with_context(|| format!("failed to open job store at {}", db.display()))?;
        Ok(Self {
            data_dir,
            store,
            config,
        })
    }

    pub fn data_dir(&self) -> &DataDir {
        &self.data_dir
    }

    pub fn store(&self) -> &SqliteJobStore {
        &self.store
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn log_layout(&self) -> LogLayout {
        self.data_dir.log_layout()
    }
}

/// Flag overrides applied on top of the enqueue JSON.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOverrides {
    pub priority: Option<i64>,
    pub run_at: Option<DateTime<Utc>>,
    pub timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
}

pub fn enqueue(ctx: &Context, raw: &str, overrides: EnqueueOverrides) -> anyhow::Result<Job> {
    let mut request = EnqueueRequest::from_json(raw)?;
    if let Some(priority) = overrides.priority {
        request = request.with_priority(priority);
    }
    if let Some(run_at) = overrides.run_at {
        request = request.with_run_at(run_at);
    }
    if let Some(secs) = overrides.timeout_secs {
        request = request.with_timeout_secs(secs);
    }
    if let Some(max_retries) = overrides.max_retries {
        request = request.with_max_retries(max_retries);
    }
    let defaults = ctx.config.load()?;
    let job = ctx.store.enqueue(request.validate(&defaults)?)?;
    Ok(job)
}

pub fn status(ctx: &Context) -> anyhow::Result<JobStats> {
    Ok(ctx.store.stats()?)
}

pub fn list(ctx: &Context, state: Option<&str>) -> anyhow::Result<Vec<Job>> {
    let state = state.map(str::parse::<JobState>).transpose()?;
    Ok(ctx.store.list(state)?)
}

pub fn dlq_list(ctx: &Context) -> anyhow::Result<Vec<Job>> {
    Ok(ctx.store.list(Some(JobState::Dead))?)
}

pub fn dlq_retry(ctx: &Context, job_id: &str) -> anyhow::Result<Job> {
    let id = JobId::new(job_id)?;
    Ok(ctx.store.retry_from_dead_letter(&id)?)
}

pub fn config_set(ctx: &Context, key: &str, value: &str) -> anyhow::Result<Value> {
    ctx.config.set(key, value)?;
    Ok(json!({ "key": key, "value": ctx.config.get(key)? }))
}

pub fn config_get(ctx: &Context, key: &str) -> anyhow::Result<Value> {
    if !KNOWN_KEYS.contains(&key) {
        return Err(DomainError::validation(format!("unknown config key {key:?}")).into());
    }
    Ok(json!({ "key": key, "value": ctx.config.get(key)? }))
}

pub fn config_show(ctx: &Context) -> anyhow::Result<BTreeMap<String, String>> {
    Ok(ctx.config.all()?)
}

pub fn log_paths(ctx: &Context, job_id: &str) -> anyhow::Result<Value> {
    let id = JobId::new(job_id)?;
    let paths = ctx.log_layout().log_paths_for(&id);
    Ok(json!({
        "job_id": id,
        "stdout": paths.stdout,
        "stderr": paths.stderr,
    }))
}

#[derive(Debug, Serialize)]
pub struct WorkerReport {
    pub workers: Vec<String>,
    pub stragglers: Vec<String>,
    pub stats: jobq_worker::WorkerStats,
}

/// Run `count` workers until Ctrl-C or SIGTERM, then stop them gracefully.
pub async fn worker_start(ctx: &Context, count: usize) -> anyhow::Result<WorkerReport> {
    if count == 0 {
        return Err(DomainError::validation("--count must be at least 1").into());
    }
    let config = ctx.config.load()?;
    let mut pool = build_pool(ctx, &config);
    pool.start(count).context("failed to start workers")?;
    let workers = pool.worker_names();
    info!(count, data_dir = %ctx.data_dir.root().display(), "workers running; Ctrl-C or SIGTERM to stop");

    shutdown_signal()
        .await
        .context("failed to listen for shutdown signals")?;
    info!("stopping workers");

    let (pool, stragglers) = tokio::task::spawn_blocking(move || {
        let stragglers = pool.stop();
        (pool, stragglers)
    })
    .await
    .context("worker shutdown task failed")?;

    Ok(WorkerReport {
        workers,
        stragglers,
        stats: pool.stats(),
    })
}

/// Resolves on the first SIGINT (Ctrl-C) or, on Unix, SIGTERM.
pub async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res,
            _ = sigterm.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

pub fn build_pool(ctx: &Context, config: &QueueConfig) -> WorkerPool<SqliteJobStore> {
    let executor = JobExecutor::new(
        ctx.store.clone(),
        ctx.log_layout(),
        JobExecutorConfig::from(config),
    );
    WorkerPool::new(executor, WorkerPoolConfig::from(config))
}

/// The store the dashboard reads from.
pub fn dashboard_store(ctx: &Context) -> Arc<dyn JobStore> {
    Arc::new(ctx.store.clone())
}

/// Whether `err` was caused by bad input rather than a system failure.
pub fn is_invalid_input(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if cause.is::<DomainError>() {
            return true;
        }
        if let Some(e) = cause.downcast_ref::<JobStoreError>() {
            return matches!(
                e,
                JobStoreError::NotFound(_)
                    | JobStoreError::AlreadyExists(_)
                    | JobStoreError::InvalidTransition { .. }
                    | JobStoreError::Domain(_)
            );
        }
        matches!(cause.downcast_ref::<ConfigError>(), Some(ConfigError::Invalid(_)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> (Context, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::open(DataDir::new(dir.path())).unwrap();
        (ctx, dir)
    }

    #[test]
    fn enqueue_applies_overrides_and_config_defaults() {
        let (ctx, _dir) = context();
        ctx.config.set("max_retries", "7").unwrap();

        let job = enqueue(
            &ctx,
            r#"{"id":"j1","command":"echo hi","priority":50}"#,
            EnqueueOverrides {
                priority: Some(5),
                timeout_secs: Some(30),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(job.priority, 5);
        assert_eq!(job.timeout_secs, Some(30));
        assert_eq!(job.max_retries, 7);
        assert_eq!(job.state, JobState::Pending);
    }

    #[test]
    fn enqueue_without_id_generates_one() {
        let (ctx, _dir) = context();
        let job = enqueue(&ctx, r#"{"command":"true"}"#, EnqueueOverrides::default()).unwrap();
        assert!(!job.id.as_str().is_empty());
        assert_eq!(list(&ctx, None).unwrap().len(), 1);
    }

    #[test]
    fn bad_input_is_classified_as_invalid() {
        let (ctx, _dir) = context();
        let not_json = enqueue(&ctx, "{nope", EnqueueOverrides::default()).unwrap_err();
        assert!(is_invalid_input(&not_json));

        enqueue(&ctx, r#"{"id":"dup","command":"true"}"#, EnqueueOverrides::default()).unwrap();
        let dup = enqueue(&ctx, r#"{"id":"dup","command":"true"}"#, EnqueueOverrides::default())
            .unwrap_err();
        assert!(is_invalid_input(&dup));

        assert!(is_invalid_input(&list(&ctx, Some("sleeping")).unwrap_err()));
        assert!(is_invalid_input(&dlq_retry(&ctx, "dup").unwrap_err()));
        assert!(is_invalid_input(&dlq_retry(&ctx, "ghost").unwrap_err()));
        assert!(is_invalid_input(&config_get(&ctx, "colour").unwrap_err()));
        assert!(is_invalid_input(
            &config_set(&ctx, "backoff_base", "-1").unwrap_err()
        ));
        assert!(!is_invalid_input(&anyhow::anyhow!("disk on fire")));
    }

    #[test]
    fn config_round_trip() {
        let (ctx, _dir) = context();
        let set = config_set(&ctx, "poll_interval_ms", "250").unwrap();
        assert_eq!(set["value"], "250");
        assert_eq!(config_get(&ctx, "poll_interval_ms").unwrap()["value"], "250");
        assert_eq!(config_get(&ctx, "max_backoff_secs").unwrap()["value"], Value::Null);
        assert_eq!(config_show(&ctx).unwrap()["poll_interval_ms"], "250");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sigterm_triggers_shutdown() {
        use std::time::Duration;
        use tokio::signal::unix::{SignalKind, signal};

        // Keeps SIGTERM handled for the whole test binary, whatever the timing.
        let _installed = signal(SignalKind::terminate()).unwrap();
        let waiter = tokio::spawn(shutdown_signal());
        // Let the handler register before the signal is sent.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("shutdown signal not observed")
            .unwrap()
            .unwrap();
    }

    #[test]
    fn log_paths_live_under_data_dir() {
        let (ctx, dir) = context();
        let paths = log_paths(&ctx, "nightly").unwrap();
        let stdout = dir.path().join("logs").join("nightly.stdout.log");
        assert_eq!(paths["stdout"], stdout.to_str().unwrap());
        assert!(is_invalid_input(&log_paths(&ctx, "../etc").unwrap_err()));
    }
}

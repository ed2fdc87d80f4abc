//! Read-only web dashboard over a [`JobStore`].

use std::fmt::Write as _;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Query},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use jobq_core::{Job, JobRun, JobState, JobStats};
use jobq_store::{JobStore, JobStoreError};

/// Jobs and runs shown on the HTML page.
pub const RECENT_LIMIT: usize = 20;

const MAX_RUNS_LIMIT: usize = 500;

type SharedStore = Arc<dyn JobStore>;

pub fn router(store: SharedStore) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/api/stats", get(stats))
        .route("/api/jobs", get(jobs))
        .route("/api/runs", get(runs))
        .layer(Extension(store))
}

pub async fn serve(listener: tokio::net::TcpListener, store: SharedStore) -> std::io::Result<()> {
    axum::serve(listener, router(store)).await
}

pub async fn health() -> StatusCode {
    StatusCode::OK
}

async fn index(Extension(store): Extension<SharedStore>) -> Response {
    let snapshot = blocking(store, |s| {
        Ok((s.stats()?, s.list(None)?, s.recent_runs(RECENT_LIMIT)?))
    })
    .await;
    match snapshot {
        Ok((stats, jobs, runs)) => {
            let recent: Vec<&Job> = jobs.iter().rev().take(RECENT_LIMIT).collect();
            Html(render_page(&stats, &recent, &runs)).into_response()
        }
        Err(resp) => resp,
    }
}

async fn stats(Extension(store): Extension<SharedStore>) -> Response {
    match blocking(store, |s| s.stats()).await {
        Ok(stats) => Json(stats).into_response(),
        Err(resp) => resp,
    }
}

#[derive(Debug, Deserialize)]
pub struct JobsQuery {
    state: Option<String>,
}

async fn jobs(Extension(store): Extension<SharedStore>, Query(q): Query<JobsQuery>) -> Response {
    let state = match q.state.as_deref().map(str::parse::<JobState>).transpose() {
        Ok(state) => state,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, "invalid_state", e.to_string()),
    };
    match blocking(store, move |s| s.list(state)).await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(resp) => resp,
    }
}

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    limit: Option<usize>,
}

async fn runs(Extension(store): Extension<SharedStore>, Query(q): Query<RunsQuery>) -> Response {
    let limit = q.limit.unwrap_or(RECENT_LIMIT).min(MAX_RUNS_LIMIT);
    match blocking(store, move |s| s.recent_runs(limit)).await {
        Ok(runs) => Json(runs).into_response(),
        Err(resp) => resp,
    }
}

/// Run a store call on the blocking pool, mapping failures to a JSON 500.
async fn blocking<T, F>(store: SharedStore, f: F) -> Result<T, Response>
where
    T: Send + 'static,
    F: FnOnce(&dyn JobStore) -> Result<T, JobStoreError> + Send + 'static,
{
    match tokio::task::spawn_blocking(move || f(store.as_ref())).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            error!(error = %e, "dashboard store query failed");
            Err(json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string()))
        }
        Err(e) => Err(json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            e.to_string(),
        )),
    }
}

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn table(headers: &[&str], rows: impl IntoIterator<Item = Vec<String>>) -> String {
    let mut html = String::from("<table border='1' cellpadding='6' cellspacing='0'><thead><tr>");
    for h in headers {
        let _ = write!(html, "<th>{}</th>", escape_html(h));
    }
    html.push_str("</tr></thead><tbody>");
    for row in rows {
        html.push_str("<tr>");
        for cell in row {
            let _ = write!(html, "<td>{}</td>", escape_html(&cell));
        }
        html.push_str("</tr>");
    }
    html.push_str("</tbody></table>");
    html
}

fn opt<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(ToString::to_string).unwrap_or_default()
}

pub fn render_page(stats: &JobStats, jobs: &[&Job], runs: &[JobRun]) -> String {
    let stats_table = table(
        &[
            "pending",
            "processing",
            "completed",
            "failed",
            "dead",
            "total_jobs",
            "total_runs",
        ],
        [vec![
            stats.pending.to_string(),
            stats.processing.to_string(),
            stats.completed.to_string(),
            stats.failed.to_string(),
            stats.dead.to_string(),
            stats.total_jobs.to_string(),
            stats.total_runs.to_string(),
        ]],
    );
    let jobs_table = table(
        &[
            "id",
            "command",
            "state",
            "priority",
            "attempts",
            "max_retries",
            "next_run_at",
            "last_error",
        ],
        jobs.iter().map(|j| {
            vec![
                j.id.to_string(),
                j.command.clone(),
                j.state.to_string(),
                j.priority.to_string(),
                j.attempts.to_string(),
                j.max_retries.to_string(),
                opt(&j.next_run_at.map(|t| t.to_rfc3339())),
                opt(&j.last_error),
            ]
        }),
    );
    let runs_table = table(
        &[
            "id",
            "job_id",
            "started_at",
            "finished_at",
            "exit_code",
            "duration_ms",
            "bytes_stdout",
            "bytes_stderr",
        ],
        runs.iter().map(|r| {
            vec![
                r.id.to_string(),
                r.job_id.to_string(),
                r.started_at.to_rfc3339(),
                r.finished_at.to_rfc3339(),
                opt(&r.exit_code),
                r.duration_ms.to_string(),
                r.bytes_stdout.to_string(),
                r.bytes_stderr.to_string(),
            ]
        }),
    );

    format!(
        "<!doctype html>\n<html><head><meta charset='utf-8'><title>jobq dashboard</title></head><body>\n\
         <h1>jobq dashboard</h1>\n<h2>Stats</h2>\n{stats_table}\n\
         <h2>Recent jobs</h2>\n{jobs_table}\n<h2>Recent runs</h2>\n{runs_table}\n</body></html>\n"
    )
}

//! HTTP API handlers — exposes the job control plane as JSON.

pub mod jobs;
pub mod status;

use std::time::Instant;

use axum::http::StatusCode;

use loom_core::JobId;
use loom_services::JobControl;

#[derive(Clone)]
pub struct ApiState {
    pub control: JobControl,
    pub started_at: Instant,
    /// Effective executor concurrency.
    pub max_jobs: usize,
    /// Runtime used when a job spec names none.
    pub default_runtime: String,
    /// Signals graceful daemon shutdown.
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

// ── Shared helpers ────────────────────────────────────────────────────────────

/// Job ids are short lowercase hex.
fn parse_job_id(raw: &str) -> Result<JobId, (StatusCode, String)> {
    if raw.is_empty() || !raw.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err((StatusCode::BAD_REQUEST, "invalid job id".to_string()));
    }
    Ok(JobId(raw.to_ascii_lowercase()))
}

fn not_found(id: &JobId) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, format!("no job {}", id))
}

// Re-export handler functions for use in router setup.
pub use jobs::{
    handle_job_cancel, handle_job_events, handle_job_inspect, handle_job_submit,
    handle_jobs_list,
};
pub use status::{handle_shutdown, handle_status};

//! /status and /daemon/shutdown handlers.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use loom_core::JobStatus;

use super::ApiState;

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize)]
pub struct JobCounts {
    pub total: usize,
    pub waiting: usize,
    pub in_progress: usize,
    pub complete: usize,
    pub failed: usize,
    pub killed: usize,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: &'static str,
    pub uptime_secs: u64,
    pub max_concurrent_jobs: usize,
    pub default_runtime: String,
    /// Worker requests currently awaiting a reply, across all jobs.
    pub requests_in_flight: usize,
    pub jobs: JobCounts,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let mut jobs = JobCounts::default();
    for record in state.control.records().await {
        jobs.total += 1;
        match record.status {
            JobStatus::Waiting => jobs.waiting += 1,
            JobStatus::InProgress => jobs.in_progress += 1,
            JobStatus::Complete => jobs.complete += 1,
            JobStatus::Failed => jobs.failed += 1,
            JobStatus::Killed => jobs.killed += 1,
        }
    }

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        max_concurrent_jobs: state.max_jobs,
        default_runtime: state.default_runtime.clone(),
        requests_in_flight: state.control.bridge().in_flight_total(),
        jobs,
    })
}

// ── /daemon/shutdown ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ShutdownResponse {
    pub message: String,
}

/// Running jobs are killed and persisted before the daemon exits.
pub async fn handle_shutdown(State(state): State<ApiState>) -> Json<ShutdownResponse> {
    tracing::info!("shutdown requested via API");
    let _ = state.shutdown_tx.send(());

    Json(ShutdownResponse {
        message: "Shutdown initiated".to_string(),
    })
}

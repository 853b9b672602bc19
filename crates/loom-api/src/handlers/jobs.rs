//! /jobs handlers — submit, list, inspect, follow and cancel training jobs.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;

use loom_core::{JobRecord, JobSpec, JobStatus};
use loom_services::{CancelOutcome, JobUpdate, SubmitError};

use super::{not_found, parse_job_id, ApiState};

// ── /jobs (POST) ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub id: String,
}

pub async fn handle_job_submit(
    State(state): State<ApiState>,
    Json(spec): Json<JobSpec>,
) -> Result<(StatusCode, Json<SubmitResponse>), (StatusCode, String)> {
    match state.control.submit(spec).await {
        Ok(id) => Ok((StatusCode::ACCEPTED, Json(SubmitResponse { id: id.0 }))),
        Err(SubmitError::Invalid(detail)) => Err((StatusCode::BAD_REQUEST, detail)),
        Err(SubmitError::Queue(e)) => Err((StatusCode::SERVICE_UNAVAILABLE, e.to_string())),
    }
}

// ── /jobs (GET) ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct JobsResponse {
    pub jobs: Vec<JobSummary>,
}

#[derive(Debug, Serialize)]
pub struct JobSummary {
    pub id: String,
    pub name: String,
    pub status: JobStatus,
    pub phase: Option<String>,
    pub progress: f64,
    pub iterations: usize,
    pub submitted_at: u64,
    pub updated_at: u64,
}

fn summarize(record: &JobRecord) -> JobSummary {
    let current = record.current_phase.and_then(|i| record.phases.get(i));
    JobSummary {
        id: record.id.0.clone(),
        name: record.name.clone(),
        status: record.status,
        phase: current.map(|p| p.name.as_str().to_string()),
        progress: current.map(|p| p.progress).unwrap_or(0.0),
        iterations: record.iterations.len(),
        submitted_at: record.submitted_at,
        updated_at: record.updated_at,
    }
}

pub async fn handle_jobs_list(State(state): State<ApiState>) -> Json<JobsResponse> {
    let jobs = state.control.records().await.iter().map(summarize).collect();
    Json(JobsResponse { jobs })
}

// ── /jobs/{id} (GET) ──────────────────────────────────────────────────────────

pub async fn handle_job_inspect(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<JobRecord>, (StatusCode, String)> {
    let id = parse_job_id(&id)?;
    state
        .control
        .record(&id)
        .await
        .map(Json)
        .ok_or_else(|| not_found(&id))
}

// ── /jobs/{id}/events (GET, SSE) ──────────────────────────────────────────────

/// One item of a job's live stream, before SSE encoding.
#[derive(Debug)]
pub enum StreamItem {
    Snapshot(JobRecord),
    Update(JobUpdate),
    /// The subscriber fell behind and this many updates were lost.
    Lagged(u64),
}

impl StreamItem {
    fn into_event(self) -> Result<Event, axum::Error> {
        match self {
            StreamItem::Snapshot(record) => Event::default().event("snapshot").json_data(record),
            StreamItem::Update(update) => Event::default().event("update").json_data(update),
            StreamItem::Lagged(n) => Ok(Event::default().event("lagged").data(n.to_string())),
        }
    }
}

/// The current snapshot, then every update until the job's terminal event.
pub fn job_stream(
    snapshot: JobRecord,
    updates: broadcast::Receiver<JobUpdate>,
) -> impl Stream<Item = StreamItem> {
    let finished = snapshot.is_terminal();
    let live = stream::unfold((updates, finished), |(mut rx, finished)| async move {
        if finished {
            return None;
        }
        match rx.recv().await {
            Ok(update) => {
                let done = update.event.is_terminal();
                Some((StreamItem::Update(update), (rx, done)))
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                Some((StreamItem::Lagged(n), (rx, false)))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    });
    stream::once(async move { StreamItem::Snapshot(snapshot) }).chain(live)
}

pub async fn handle_job_events(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, (StatusCode, String)> {
    let id = parse_job_id(&id)?;
    let (snapshot, updates) = match state.control.observe(&id) {
        Some(live) => live,
        // Evicted jobs are finished: the stream is just their final record.
        None => {
            let record = state.control.record(&id).await.ok_or_else(|| not_found(&id))?;
            (record, broadcast::channel::<JobUpdate>(1).1)
        }
    };
    tracing::debug!(job_id = %id, "event stream opened");
    let events = job_stream(snapshot, updates).map(StreamItem::into_event);
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

// ── /jobs/{id}/cancel (POST) ──────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub id: String,
    pub outcome: CancelOutcome,
}

pub async fn handle_job_cancel(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, (StatusCode, String)> {
    let id = parse_job_id(&id)?;
    match state.control.cancel(&id).await {
        CancelOutcome::NotFound => Err(not_found(&id)),
        outcome => Ok(Json(CancelResponse { id: id.0, outcome })),
    }
}

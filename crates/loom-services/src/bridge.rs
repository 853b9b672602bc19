//! Observability bridge — in-memory job snapshots plus live update fan-out.
//!
//! The bridge is the orchestrator's `JobHooks` observer. Every event
//! replaces the job's snapshot and is broadcast to that job's subscribers.
//! Sends never block; a slow subscriber lags and loses updates, and a
//! dropped one is simply gone. Cancellation flows the other way through a
//! per-job `CancellationToken`.
//!
//! Finished jobs stay in memory only up to the retention cap; older ones are
//! evicted and served from the `RecordStore` instead.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use loom_core::{JobId, JobRecord};

use crate::hooks::{JobEvent, JobHooks, RequestGuard};

/// Per-job broadcast buffer. Subscribers further behind than this lag.
const UPDATE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct JobUpdate {
    pub event: JobEvent,
    pub snapshot: JobRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Kill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Requested,
    AlreadyFinished,
    NotFound,
}

struct JobEntry {
    snapshot: JobRecord,
    updates: broadcast::Sender<JobUpdate>,
    cancel: CancellationToken,
    in_flight: Arc<AtomicUsize>,
}

impl JobEntry {
    fn new(snapshot: JobRecord) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        Self {
            snapshot,
            updates,
            cancel: CancellationToken::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[derive(Clone, Default)]
pub struct ObservabilityBridge {
    jobs: Arc<DashMap<JobId, JobEntry>>,
    in_flight_total: Arc<AtomicUsize>,
    /// Finished jobs kept in memory. 0 = keep all.
    retain_finished: usize,
}

impl ObservabilityBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retain_finished: usize) -> Self {
        Self {
            retain_finished,
            ..Self::default()
        }
    }

    /// Track a newly submitted job and return its cancellation token.
    pub fn register(&self, record: JobRecord) -> CancellationToken {
        let id = record.id.clone();
        let entry = JobEntry::new(record);
        let token = entry.cancel.clone();
        let _ = entry.updates.send(JobUpdate {
            event: JobEvent::Submitted,
            snapshot: entry.snapshot.clone(),
        });
        self.jobs.insert(id.clone(), entry);
        tracing::debug!(job_id = %id, "job registered");
        token
    }

    /// Re-insert a record loaded from the store. Existing entries win.
    pub fn restore(&self, record: JobRecord) {
        self.jobs
            .entry(record.id.clone())
            .or_insert_with(|| JobEntry::new(record));
        self.evict_finished();
    }

    /// Drop the oldest finished jobs beyond the retention cap.
    fn evict_finished(&self) -> usize {
        if self.retain_finished == 0 {
            return 0;
        }
        let mut finished: Vec<(u64, u64, JobId)> = self
            .jobs
            .iter()
            .filter(|e| e.snapshot.is_terminal())
            .map(|e| (e.snapshot.updated_at, e.snapshot.submitted_at, e.key().clone()))
            .collect();
        if finished.len() <= self.retain_finished {
            return 0;
        }
        finished.sort();
        let excess = finished.len() - self.retain_finished;
        for (_, _, id) in finished.into_iter().take(excess) {
            self.jobs.remove(&id);
            tracing::debug!(job_id = %id, "finished job evicted from memory");
        }
        excess
    }

    pub fn remove(&self, id: &JobId) -> Option<JobRecord> {
        self.jobs.remove(id).map(|(_, e)| e.snapshot)
    }

    pub fn snapshot(&self, id: &JobId) -> Option<JobRecord> {
        self.jobs.get(id).map(|e| e.snapshot.clone())
    }

    /// Current snapshot plus a receiver for every later update.
    pub fn observe(&self, id: &JobId) -> Option<(JobRecord, broadcast::Receiver<JobUpdate>)> {
        // Holding the entry guard keeps snapshot and subscription consistent.
        self.jobs
            .get(id)
            .map(|e| (e.snapshot.clone(), e.updates.subscribe()))
    }

    /// Newest submission first.
    pub fn list(&self) -> Vec<JobRecord> {
        let mut all: Vec<JobRecord> = self.jobs.iter().map(|e| e.snapshot.clone()).collect();
        all.sort_by(|a, b| {
            b.submitted_at
                .cmp(&a.submitted_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        all
    }

    pub fn control(&self, id: &JobId, command: ControlCommand) -> CancelOutcome {
        match command {
            ControlCommand::Kill => self.cancel(id),
        }
    }

    /// Ask the job to stop. The orchestrator notices at its next checkpoint.
    pub fn cancel(&self, id: &JobId) -> CancelOutcome {
        let Some(entry) = self.jobs.get(id) else {
            return CancelOutcome::NotFound;
        };
        if entry.snapshot.is_terminal() {
            return CancelOutcome::AlreadyFinished;
        }
        entry.cancel.cancel();
        tracing::info!(job_id = %id, "cancellation requested");
        CancelOutcome::Requested
    }

    /// Cancel every job that has not finished. Used at shutdown.
    pub fn cancel_all(&self) -> usize {
        let mut n = 0;
        for entry in self.jobs.iter() {
            if !entry.snapshot.is_terminal() && !entry.cancel.is_cancelled() {
                entry.cancel.cancel();
                n += 1;
            }
        }
        n
    }

    pub fn in_flight(&self, id: &JobId) -> usize {
        self.jobs
            .get(id)
            .map(|e| e.in_flight.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn in_flight_total(&self) -> usize {
        self.in_flight_total.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl JobHooks for ObservabilityBridge {
    fn on_event(&self, record: &JobRecord, event: &JobEvent) {
        {
            let Some(mut entry) = self.jobs.get_mut(&record.id) else {
                tracing::warn!(job_id = %record.id, "event for unregistered job dropped");
                return;
            };
            entry.snapshot = record.clone();
            // No receivers is fine.
            let _ = entry.updates.send(JobUpdate {
                event: event.clone(),
                snapshot: record.clone(),
            });
        }
        // The guard above must be released before the map is walked.
        if event.is_terminal() {
            self.evict_finished();
        }
    }

    fn track_requests(&self, job: &JobId, n: usize) -> Option<RequestGuard> {
        let per_job = self.jobs.get(job).map(|e| e.in_flight.clone())?;
        Some(RequestGuard::new(
            vec![per_job, self.in_flight_total.clone()],
            n,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::{JobStatus, PhaseName};

    fn record(id: &str) -> JobRecord {
        JobRecord::new(JobId::from(id), "job")
    }

    #[tokio::test]
    async fn events_update_snapshot_and_reach_subscribers() {
        let bridge = ObservabilityBridge::new();
        bridge.register(record("a"));
        let (snap, mut rx) = bridge.observe(&JobId::from("a")).unwrap();
        assert_eq!(snap.status, JobStatus::Waiting);

        let mut r = record("a");
        r.begin_phase(PhaseName::ScanData);
        bridge.on_event(&r, &JobEvent::PhaseStarted { phase: PhaseName::ScanData });

        let update = rx.recv().await.unwrap();
        assert_eq!(update.event, JobEvent::PhaseStarted { phase: PhaseName::ScanData });
        assert_eq!(update.snapshot.status, JobStatus::InProgress);
        assert_eq!(
            bridge.snapshot(&JobId::from("a")).unwrap().status,
            JobStatus::InProgress
        );
    }

    #[test]
    fn dropped_and_lagging_subscribers_never_block() {
        let bridge = ObservabilityBridge::new();
        bridge.register(record("a"));
        let (_, rx) = bridge.observe(&JobId::from("a")).unwrap();
        drop(rx);
        let (_, _slow) = bridge.observe(&JobId::from("a")).unwrap();

        let r = record("a");
        for i in 0..(UPDATE_CAPACITY * 2) {
            bridge.on_event(
                &r,
                &JobEvent::Log {
                    phase: None,
                    line: format!("{i}"),
                },
            );
        }
        assert!(bridge.snapshot(&JobId::from("a")).is_some());
    }

    #[test]
    fn cancel_reports_outcome() {
        let bridge = ObservabilityBridge::new();
        let token = bridge.register(record("live"));
        assert_eq!(bridge.cancel(&JobId::from("live")), CancelOutcome::Requested);
        assert!(token.is_cancelled());
        assert_eq!(bridge.cancel(&JobId::from("ghost")), CancelOutcome::NotFound);

        let mut done = record("done");
        done.begin_phase(PhaseName::ScanData);
        done.fail_phase(PhaseName::ScanData, "boom");
        bridge.restore(done);
        assert_eq!(
            bridge.control(&JobId::from("done"), ControlCommand::Kill),
            CancelOutcome::AlreadyFinished
        );
    }

    #[test]
    fn request_guards_count_per_job_and_total() {
        let bridge = ObservabilityBridge::new();
        bridge.register(record("a"));
        bridge.register(record("b"));
        let a = JobId::from("a");
        let b = JobId::from("b");

        let g1 = bridge.track_requests(&a, 3).unwrap();
        let g2 = bridge.track_requests(&b, 1).unwrap();
        assert_eq!(bridge.in_flight(&a), 3);
        assert_eq!(bridge.in_flight_total(), 4);
        drop(g1);
        assert_eq!(bridge.in_flight(&a), 0);
        assert_eq!(bridge.in_flight_total(), 1);
        drop(g2);
        assert_eq!(bridge.in_flight_total(), 0);
        assert!(bridge.track_requests(&JobId::from("none"), 1).is_none());
    }

    #[test]
    fn oldest_finished_jobs_are_evicted_past_the_cap() {
        let bridge = ObservabilityBridge::with_retention(2);
        for (id, at) in [("f1", 1), ("f2", 2), ("f3", 3)] {
            let mut r = record(id);
            r.begin_phase(PhaseName::ScanData);
            r.fail_phase(PhaseName::ScanData, "boom");
            r.updated_at = at;
            bridge.restore(r);
        }
        assert!(bridge.snapshot(&JobId::from("f1")).is_none());
        assert_eq!(bridge.len(), 2);

        // Running jobs never count against the cap.
        bridge.register(record("live"));
        let mut live = record("live");
        live.begin_phase(PhaseName::ScanData);
        live.fail_phase(PhaseName::ScanData, "late");
        live.updated_at = 10;
        bridge.on_event(&live, &JobEvent::PhaseStarted { phase: PhaseName::ScanData });
        assert_eq!(bridge.len(), 3);
        bridge.on_event(&live, &JobEvent::Finished { status: JobStatus::Failed });
        assert_eq!(bridge.len(), 2);
        assert!(bridge.snapshot(&JobId::from("f2")).is_none());
        assert!(bridge.snapshot(&JobId::from("live")).is_some());
    }

    #[test]
    fn list_is_newest_first() {
        let bridge = ObservabilityBridge::new();
        let mut old = record("old");
        old.submitted_at = 1;
        let mut new = record("new");
        new.submitted_at = 2;
        bridge.restore(old);
        bridge.restore(new);
        let ids: Vec<_> = bridge.list().into_iter().map(|r| r.id.0).collect();
        assert_eq!(ids, ["new", "old"]);
    }
}

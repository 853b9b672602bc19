//! Orchestrator → observer interface.
//!
//! Hook calls are synchronous and must never block: the orchestrator calls
//! them inline between worker requests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;

use loom_core::{JobId, JobRecord, JobStatus, PhaseName};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Submitted,
    PhaseStarted {
        phase: PhaseName,
    },
    Progress {
        phase: PhaseName,
        fraction: f64,
    },
    Log {
        phase: Option<PhaseName>,
        line: String,
    },
    Iteration {
        index: u64,
        metrics: BTreeMap<String, f64>,
        smoothed: BTreeMap<String, f64>,
    },
    Result {
        phase: PhaseName,
        metrics: BTreeMap<String, f64>,
    },
    PhaseFinished {
        phase: PhaseName,
    },
    PhaseFailed {
        phase: PhaseName,
        detail: String,
    },
    Finished {
        status: JobStatus,
    },
}

impl JobEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::Finished { .. })
    }
}

pub trait JobHooks: Send + Sync {
    /// `record` already reflects the event.
    fn on_event(&self, record: &JobRecord, event: &JobEvent);

    /// Count `n` worker requests in flight for `job` until the guard drops.
    fn track_requests(&self, _job: &JobId, _n: usize) -> Option<RequestGuard> {
        None
    }
}

/// Ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl JobHooks for NoopHooks {
    fn on_event(&self, _record: &JobRecord, _event: &JobEvent) {}
}

/// Adds `n` to each counter on creation and subtracts it on drop.
#[derive(Debug)]
pub struct RequestGuard {
    counters: Vec<Arc<AtomicUsize>>,
    n: usize,
}

impl RequestGuard {
    pub fn new(counters: Vec<Arc<AtomicUsize>>, n: usize) -> Self {
        for c in &counters {
            c.fetch_add(n, Ordering::SeqCst);
        }
        Self { counters, n }
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        for c in &self.counters {
            c.fetch_sub(self.n, Ordering::SeqCst);
        }
    }
}

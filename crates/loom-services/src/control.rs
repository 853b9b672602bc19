//! Job control surface: submit, observe, cancel.

use std::sync::Arc;

use tokio::sync::broadcast;

use loom_core::{JobId, JobRecord, JobSpec};

use crate::bridge::{CancelOutcome, JobUpdate, ObservabilityBridge};
use crate::queue::{JobQueue, QueueError, QueuedJob};
use crate::record_store::RecordStore;

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("invalid job: {0}")]
    Invalid(String),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Clone)]
pub struct JobControl {
    bridge: ObservabilityBridge,
    queue: Arc<dyn JobQueue>,
    /// Finished jobs evicted from the bridge are read back from here.
    store: Option<Arc<dyn RecordStore>>,
}

impl JobControl {
    pub fn new(bridge: ObservabilityBridge, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            bridge,
            queue,
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn bridge(&self) -> &ObservabilityBridge {
        &self.bridge
    }

    /// Validate, register and enqueue. The job is visible (as `waiting`)
    /// before this returns.
    pub async fn submit(&self, spec: JobSpec) -> Result<JobId, SubmitError> {
        spec.validate().map_err(SubmitError::Invalid)?;
        let id = JobId::generate(&spec.name);
        let cancel = self.bridge.register(JobRecord::new(id.clone(), spec.name.clone()));

        let job = QueuedJob {
            id: id.clone(),
            spec,
            cancel,
        };
        if let Err(e) = self.queue.submit(job).await {
            self.bridge.remove(&id);
            tracing::warn!(job_id = %id, error = %e, "job rejected by queue");
            return Err(e.into());
        }
        tracing::info!(job_id = %id, "job submitted");
        Ok(id)
    }

    pub fn observe(&self, id: &JobId) -> Option<(JobRecord, broadcast::Receiver<JobUpdate>)> {
        self.bridge.observe(id)
    }

    pub fn snapshot(&self, id: &JobId) -> Option<JobRecord> {
        self.bridge.snapshot(id)
    }

    pub fn list(&self) -> Vec<JobRecord> {
        self.bridge.list()
    }

    async fn stored(&self, id: &JobId) -> Option<JobRecord> {
        let store = self.store.as_ref()?;
        match store.load(id).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "failed to read stored job record");
                None
            }
        }
    }

    /// Live snapshot, or the persisted record of an evicted job.
    pub async fn record(&self, id: &JobId) -> Option<JobRecord> {
        match self.bridge.snapshot(id) {
            Some(record) => Some(record),
            None => self.stored(id).await,
        }
    }

    /// Every known job, in memory or persisted, newest submission first.
    pub async fn records(&self) -> Vec<JobRecord> {
        let mut all = self.bridge.list();
        if let Some(store) = &self.store {
            match store.list().await {
                Ok(stored) => {
                    for record in stored {
                        if !all.iter().any(|r| r.id == record.id) {
                            all.push(record);
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to list stored job records"),
            }
        }
        all.sort_by(|a, b| {
            b.submitted_at
                .cmp(&a.submitted_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        all
    }

    pub async fn cancel(&self, id: &JobId) -> CancelOutcome {
        match self.bridge.cancel(id) {
            CancelOutcome::NotFound if self.stored(id).await.is_some() => {
                CancelOutcome::AlreadyFinished
            }
            outcome => outcome,
        }
    }
}

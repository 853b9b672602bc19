//! Job queue collaborator. Submission goes through `JobQueue`; the executor
//! consumes the other end.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use loom_core::{JobId, JobSpec};

#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: JobId,
    pub spec: JobSpec,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("job queue is full")]
    Full,
    #[error("job queue is closed")]
    Closed,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn submit(&self, job: QueuedJob) -> Result<(), QueueError>;
}

/// In-process queue backed by a bounded tokio channel.
#[derive(Debug, Clone)]
pub struct LocalQueue {
    tx: mpsc::Sender<QueuedJob>,
}

impl LocalQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<QueuedJob>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl JobQueue for LocalQueue {
    /// Never waits: a full queue is reported to the submitter.
    async fn submit(&self, job: QueuedJob) -> Result<(), QueueError> {
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full,
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })
    }
}

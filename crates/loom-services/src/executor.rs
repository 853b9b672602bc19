//! Job executor — consumes queued jobs and runs their orchestrators.
//!
//! At most `max_concurrent_jobs` orchestrators run at once (semaphore).
//! Terminal records are persisted through the `RecordStore`. On shutdown
//! every unfinished job is cancelled and still drained to a terminal state.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use loom_core::JobRecord;

use crate::bridge::ObservabilityBridge;
use crate::hooks::JobHooks;
use crate::launcher::WorkerLauncher;
use crate::orchestrator::{JobOrchestrator, JobOutcome, OrchestratorSettings};
use crate::queue::QueuedJob;
use crate::record_store::RecordStore;

#[derive(Clone)]
pub struct Executor {
    bridge: ObservabilityBridge,
    launcher: Arc<dyn WorkerLauncher>,
    store: Arc<dyn RecordStore>,
    settings: OrchestratorSettings,
    max_jobs: usize,
}

impl Executor {
    /// `max_concurrent_jobs` 0 = available parallelism.
    pub fn new(
        bridge: ObservabilityBridge,
        launcher: Arc<dyn WorkerLauncher>,
        store: Arc<dyn RecordStore>,
        settings: OrchestratorSettings,
        max_concurrent_jobs: u32,
    ) -> Self {
        let max_jobs = if max_concurrent_jobs == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            max_concurrent_jobs as usize
        };
        Self {
            bridge,
            launcher,
            store,
            settings,
            max_jobs,
        }
    }

    pub fn max_jobs(&self) -> usize {
        self.max_jobs
    }

    /// Runs until `shutdown` fires or every queue sender is gone.
    pub async fn run(self, mut jobs: mpsc::Receiver<QueuedJob>, shutdown: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.max_jobs));
        let mut running = JoinSet::new();
        let mut leftover = Vec::new();

        tracing::info!(max_concurrent = self.max_jobs, "job executor started");

        loop {
            let job = tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(done) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = done {
                        tracing::error!(error = %e, "job task panicked");
                    }
                    continue;
                }
                job = jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = shutdown.cancelled() => {
                    leftover.push(job);
                    break;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => {
                        leftover.push(job);
                        break;
                    }
                },
            };

            tracing::debug!(job_id = %job.id, "job dequeued");
            let this = self.clone();
            running.spawn(async move {
                let _permit = permit;
                this.run_job(job).await;
            });
        }

        // Anything not yet started still has to reach a terminal record.
        jobs.close();
        while let Ok(job) = jobs.try_recv() {
            leftover.push(job);
        }
        let cancelled = self.bridge.cancel_all();
        tracing::info!(
            cancelled,
            unstarted = leftover.len(),
            "job executor shutting down"
        );
        for job in leftover {
            job.cancel.cancel();
            let this = self.clone();
            running.spawn(async move { this.run_job(job).await });
        }
        while let Some(done) = running.join_next().await {
            if let Err(e) = done {
                tracing::error!(error = %e, "job task panicked");
            }
        }
        tracing::info!("job executor stopped");
    }

    async fn run_job(&self, job: QueuedJob) {
        let record = match self.bridge.snapshot(&job.id) {
            Some(r) => r,
            None => {
                let r = JobRecord::new(job.id.clone(), job.spec.name.clone());
                self.bridge.restore(r.clone());
                r
            }
        };
        let hooks: Arc<dyn JobHooks> = Arc::new(self.bridge.clone());
        let orchestrator = JobOrchestrator::new(
            record,
            job.spec,
            self.settings.clone(),
            self.launcher.clone(),
            hooks,
            job.cancel,
        );

        let (outcome, record) = orchestrator.run().await;
        match &outcome {
            JobOutcome::Complete => tracing::info!(job_id = %record.id, "job complete"),
            JobOutcome::Killed => tracing::info!(job_id = %record.id, "job killed"),
            JobOutcome::Failed(detail) => {
                tracing::warn!(job_id = %record.id, error = %detail, "job failed")
            }
        }
        if let Err(e) = self.store.save(&record).await {
            tracing::error!(job_id = %record.id, error = %e, "failed to persist job record");
        }
    }
}

//! loom-services — worker supervision, job orchestration and the
//! observability bridge. Everything here is transport-agnostic: the HTTP
//! surface lives in loom-api and the daemon wiring in loomd.

pub mod bridge;
pub mod control;
pub mod dataset;
pub mod executor;
pub mod hooks;
pub mod launcher;
pub mod orchestrator;
pub mod queue;
pub mod record_store;
pub mod supervisor;
pub mod transform;
pub mod worker;

pub use bridge::{CancelOutcome, ControlCommand, JobUpdate, ObservabilityBridge};
pub use control::{JobControl, SubmitError};
pub use executor::Executor;
pub use hooks::{JobEvent, JobHooks, NoopHooks, RequestGuard};
pub use launcher::{ProcessLauncher, WorkerLauncher};
pub use orchestrator::{JobOrchestrator, JobOutcome, OrchestratorSettings};
pub use queue::{JobQueue, LocalQueue, QueueError, QueuedJob};
pub use record_store::{FileRecordStore, RecordStore, RecordStoreError};
pub use supervisor::{PhaseError, TrainingSupervisor};
pub use transform::TransformWorker;
pub use worker::{
    LaunchCommand, PendingReply, RequestError, StartupError, WorkerClient, WorkerLog,
    WorkerOptions, WorkerState,
};

#[cfg(test)]
mod testing;

//! Worker launch seam. Phases never spawn processes directly; they ask a
//! `WorkerLauncher`, so the orchestrator can run against in-memory workers.

use async_trait::async_trait;

use crate::worker::{LaunchCommand, StartupError, WorkerClient, WorkerOptions};

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Return a client that has completed its handshake.
    async fn launch(
        &self,
        command: LaunchCommand,
        options: WorkerOptions,
    ) -> Result<WorkerClient, StartupError>;
}

/// Spawns real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(
        &self,
        command: LaunchCommand,
        options: WorkerOptions,
    ) -> Result<WorkerClient, StartupError> {
        let mut client = WorkerClient::new(command, options);
        client.start().await?;
        Ok(client)
    }
}

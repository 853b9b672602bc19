//! Per-record transform worker — a user script that maps one object to
//! another over the line protocol.

use std::path::PathBuf;

use serde_json::Value;

use loom_core::wire::Request;
use loom_core::TransformSpec;

use crate::launcher::WorkerLauncher;
use crate::supervisor::PhaseError;
use crate::worker::{LaunchCommand, RequestError, StartupError, WorkerClient, WorkerOptions};

pub struct TransformWorker {
    client: Option<WorkerClient>,
    name: String,
}

impl TransformWorker {
    pub async fn start(
        launcher: &dyn WorkerLauncher,
        spec: &TransformSpec,
        working_dir: Option<PathBuf>,
        options: WorkerOptions,
    ) -> Result<Self, StartupError> {
        let command = LaunchCommand {
            program: spec.program.clone(),
            args: spec.args.clone(),
            working_dir,
            env: Vec::new(),
        };
        let name = options.name.clone();
        let client = launcher.launch(command, options).await?;
        tracing::info!(worker = %name, program = %spec.program, "transform worker started");
        Ok(Self {
            client: Some(client),
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn client(&self) -> Result<&WorkerClient, RequestError> {
        self.client
            .as_ref()
            .ok_or(RequestError::NotReady(crate::worker::WorkerState::Terminated))
    }

    /// Transform one object. Failures local to this object come back as
    /// `RequestError::Worker`; the worker stays usable.
    pub async fn transform(&self, object: Value) -> Result<Value, RequestError> {
        let client = self.client()?;
        client
            .send(client.next_request_id("transform"), Request::Transform { object })
            .await
    }

    pub fn check_alive(&self) -> Result<(), PhaseError> {
        match &self.client {
            Some(client) if !client.state().accepts_requests() => Err(PhaseError::WorkerLost {
                worker: self.name.clone(),
                cause: client
                    .failure()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| format!("{:?}", client.state())),
            }),
            _ => Ok(()),
        }
    }

    /// Kill the script. Repeats are no-ops.
    pub async fn terminate(&mut self) {
        if let Some(client) = self.client.take() {
            client.kill().await;
            tracing::info!(worker = %self.name, "transform worker terminated");
        }
    }
}

//! Training supervisor — walks one runtime process through its lifecycle.
//!
//! Steps run in order: generate the artifact, start the process, optionally
//! load a saved model state, load objects, then process or train. Calling a
//! step before its predecessor succeeded is `PhaseError::OutOfOrder`.
//! `terminate` is always safe and runs at most once per process.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

use loom_core::wire::Request;
use loom_core::{JobId, RuntimeSpec};

use crate::dataset::DatasetError;
use crate::launcher::WorkerLauncher;
use crate::worker::{
    LaunchCommand, PendingReply, RequestError, StartupError, WorkerClient, WorkerOptions,
};

/// Placeholder in runtime args replaced with the artifact path.
pub const ARTIFACT_PLACEHOLDER: &str = "{artifact}";

const DEFAULT_ARTIFACT_NAME: &str = "architecture.json";

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum PhaseError {
    #[error("{step} called while supervisor is {stage}")]
    OutOfOrder {
        step: &'static str,
        stage: &'static str,
    },

    #[error("{step} failed: {source}")]
    Startup {
        step: &'static str,
        #[source]
        source: StartupError,
    },

    #[error("{step} failed: {source}")]
    Request {
        step: &'static str,
        #[source]
        source: RequestError,
    },

    #[error("{step} failed: {detail}")]
    Artifact { step: &'static str, detail: String },

    #[error("{step} returned an unusable reply: {detail}")]
    InvalidReply { step: &'static str, detail: String },

    #[error("worker {worker} is gone: {cause}")]
    WorkerLost { worker: String, cause: String },

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error("job cancelled")]
    Cancelled,
}

impl PhaseError {
    fn request(step: &'static str) -> impl FnOnce(RequestError) -> PhaseError {
        move |source| PhaseError::Request { step, source }
    }

    fn artifact(step: &'static str, path: &Path, e: impl std::fmt::Display) -> PhaseError {
        PhaseError::Artifact {
            step,
            detail: format!("{}: {e}", path.display()),
        }
    }
}

// ── Supervisor ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Created,
    ArtifactReady,
    Running,
    Terminated,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Created => "created",
            Stage::ArtifactReady => "artifact_ready",
            Stage::Running => "running",
            Stage::Terminated => "terminated",
        }
    }
}

pub struct TrainingSupervisor {
    job_id: JobId,
    job_dir: PathBuf,
    runtime: RuntimeSpec,
    model_path: Option<PathBuf>,
    options: WorkerOptions,
    launcher: Arc<dyn WorkerLauncher>,
    stage: Stage,
    artifact: Option<PathBuf>,
    client: Option<WorkerClient>,
}

impl TrainingSupervisor {
    /// `runtime.program` must already be resolved (non-empty).
    pub fn new(
        job_id: JobId,
        job_dir: PathBuf,
        runtime: RuntimeSpec,
        options: WorkerOptions,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        Self {
            job_id,
            job_dir,
            runtime,
            model_path: None,
            options,
            launcher,
            stage: Stage::Created,
            artifact: None,
            client: None,
        }
    }

    /// Value for the `{{model_path}}` template placeholder.
    pub fn with_model_path(mut self, path: Option<PathBuf>) -> Self {
        self.model_path = path;
        self
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn artifact(&self) -> Option<&Path> {
        self.artifact.as_deref()
    }

    pub fn client(&self) -> Option<&WorkerClient> {
        self.client.as_ref()
    }

    fn expect_stage(&self, want: Stage, step: &'static str) -> Result<(), PhaseError> {
        if self.stage == want {
            Ok(())
        } else {
            Err(PhaseError::OutOfOrder {
                step,
                stage: self.stage.as_str(),
            })
        }
    }

    fn running(&self, step: &'static str) -> Result<&WorkerClient, PhaseError> {
        match (self.stage, &self.client) {
            (Stage::Running, Some(client)) => Ok(client),
            _ => Err(PhaseError::OutOfOrder {
                step,
                stage: self.stage.as_str(),
            }),
        }
    }

    /// Step 1: render the runtime artifact into the job directory.
    pub async fn generate_artifact(&mut self, architecture: &Value) -> Result<PathBuf, PhaseError> {
        const STEP: &str = "generate_artifact";
        self.expect_stage(Stage::Created, STEP)?;

        tokio::fs::create_dir_all(&self.job_dir)
            .await
            .map_err(|e| PhaseError::artifact(STEP, &self.job_dir, e))?;
        let pretty = serde_json::to_string_pretty(architecture)
            .map_err(|e| PhaseError::artifact(STEP, &self.job_dir, e))?;

        let (contents, default_name) = match &self.runtime.template {
            Some(template) => {
                let text = tokio::fs::read_to_string(template)
                    .await
                    .map_err(|e| PhaseError::artifact(STEP, template, e))?;
                let model_path = self
                    .model_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                let rendered = render_template(
                    &text,
                    &[
                        ("architecture", pretty.as_str()),
                        ("job_id", self.job_id.as_str()),
                        ("model_path", model_path.as_str()),
                    ],
                );
                let name = template
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.strip_suffix(".tmpl").unwrap_or(n).to_string())
                    .unwrap_or_else(|| DEFAULT_ARTIFACT_NAME.to_string());
                (rendered, name)
            }
            None => (pretty, DEFAULT_ARTIFACT_NAME.to_string()),
        };

        let name = self.runtime.artifact_name.clone().unwrap_or(default_name);
        let path = self.job_dir.join(name);
        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| PhaseError::artifact(STEP, &path, e))?;

        tracing::info!(job_id = %self.job_id, artifact = %path.display(), "artifact generated");
        self.artifact = Some(path.clone());
        self.stage = Stage::ArtifactReady;
        Ok(path)
    }

    /// Step 2: launch the runtime against the generated artifact.
    pub async fn start_process(&mut self) -> Result<(), PhaseError> {
        const STEP: &str = "start_process";
        self.expect_stage(Stage::ArtifactReady, STEP)?;
        let artifact = self
            .artifact
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();

        let command = LaunchCommand {
            program: self.runtime.program.clone(),
            args: self
                .runtime
                .args
                .iter()
                .map(|a| a.replace(ARTIFACT_PLACEHOLDER, &artifact))
                .collect(),
            working_dir: Some(self.job_dir.clone()),
            env: vec![("LOOM_JOB_ID".to_string(), self.job_id.to_string())],
        };

        let client = self
            .launcher
            .launch(command, self.options.clone())
            .await
            .map_err(|source| PhaseError::Startup { step: STEP, source })?;
        tracing::info!(
            job_id = %self.job_id,
            worker = client.name(),
            pid = ?client.pid(),
            "runtime started"
        );
        self.client = Some(client);
        self.stage = Stage::Running;
        Ok(())
    }

    /// Step 3: restore a previously saved model state.
    pub async fn load_model_state(&self, path: &Path) -> Result<(), PhaseError> {
        const STEP: &str = "load_model_state";
        let client = self.running(STEP)?;
        let request = Request::LoadModel {
            path: path.display().to_string(),
        };
        client
            .send(client.next_request_id("load_model"), request)
            .await
            .map_err(PhaseError::request(STEP))?;
        Ok(())
    }

    /// Step 4: register one object, correlated by its own id. Returns as soon
    /// as the frame is written so many loads can be in flight together.
    pub async fn load_object(
        &self,
        id: &str,
        input: Value,
        output: Value,
    ) -> Result<PendingReply, PhaseError> {
        const STEP: &str = "load_object";
        self.running(STEP)?
            .dispatch(id, Request::Load { input, output })
            .await
            .map_err(PhaseError::request(STEP))
    }

    /// Step 5: run the model over loaded objects. Outputs come back in `ids` order.
    pub async fn process_objects(&self, ids: &[String]) -> Result<Vec<Value>, PhaseError> {
        const STEP: &str = "process_objects";
        let client = self.running(STEP)?;
        let value = client
            .send(
                client.next_request_id("process"),
                Request::Process { ids: ids.to_vec() },
            )
            .await
            .map_err(PhaseError::request(STEP))?;
        order_outputs(ids, value).map_err(|detail| PhaseError::InvalidReply { step: STEP, detail })
    }

    /// One training pass over loaded objects; the reply is a metric map.
    pub async fn train_iteration(
        &self,
        ids: &[String],
        iteration: u64,
    ) -> Result<BTreeMap<String, f64>, PhaseError> {
        const STEP: &str = "train_iteration";
        let client = self.running(STEP)?;
        let value = client
            .send(
                client.next_request_id("train"),
                Request::Train {
                    ids: ids.to_vec(),
                    iteration,
                },
            )
            .await
            .map_err(PhaseError::request(STEP))?;
        parse_metrics(value).map_err(|detail| PhaseError::InvalidReply { step: STEP, detail })
    }

    pub async fn save_model_state(&self, path: &Path) -> Result<(), PhaseError> {
        const STEP: &str = "save_model_state";
        let client = self.running(STEP)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PhaseError::artifact(STEP, parent, e))?;
        }
        let request = Request::Save {
            path: path.display().to_string(),
        };
        client
            .send(client.next_request_id("save"), request)
            .await
            .map_err(PhaseError::request(STEP))?;
        Ok(())
    }

    /// Step 6: kill the runtime. Safe from any stage; repeats are no-ops.
    pub async fn terminate(&mut self) {
        if let Some(client) = self.client.take() {
            client.kill().await;
            tracing::info!(job_id = %self.job_id, worker = client.name(), "runtime terminated");
        }
        self.stage = Stage::Terminated;
    }

    /// Checkpoint probe: a running process that died surfaces here.
    pub fn check_alive(&self) -> Result<(), PhaseError> {
        match (&self.client, self.stage) {
            (Some(client), Stage::Running) if !client.state().accepts_requests() => {
                Err(PhaseError::WorkerLost {
                    worker: client.name().to_string(),
                    cause: client
                        .failure()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| format!("{:?}", client.state())),
                })
            }
            _ => Ok(()),
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Replace `{{key}}` (and `{{ key }}`) for every pair.
fn render_template(text: &str, values: &[(&str, &str)]) -> String {
    let mut out = text.to_string();
    for (key, value) in values {
        out = out
            .replace(&format!("{{{{{key}}}}}"), value)
            .replace(&format!("{{{{ {key} }}}}"), value);
    }
    out
}

fn keyed_entry(item: &Value) -> Option<(&str, &Value)> {
    let obj = item.as_object()?;
    Some((obj.get("id")?.as_str()?, obj.get("value")?))
}

/// Line a `process` reply up with the requested ids.
///
/// Accepted shapes: an array of `{id, value}` entries (any order), a map
/// keyed by id, or a plain array taken positionally.
fn order_outputs(ids: &[String], value: Value) -> Result<Vec<Value>, String> {
    match value {
        Value::Array(items) if !items.is_empty() && items.iter().all(|i| keyed_entry(i).is_some()) => {
            let mut by_id: HashMap<&str, &Value> = items.iter().filter_map(keyed_entry).collect();
            ids.iter()
                .map(|id| {
                    by_id
                        .remove(id.as_str())
                        .cloned()
                        .ok_or_else(|| format!("no output for object {id:?}"))
                })
                .collect()
        }
        Value::Array(items) if items.len() == ids.len() => Ok(items),
        Value::Array(items) => Err(format!(
            "expected {} outputs, got {}",
            ids.len(),
            items.len()
        )),
        Value::Object(mut map) => ids
            .iter()
            .map(|id| {
                map.remove(id)
                    .ok_or_else(|| format!("no output for object {id:?}"))
            })
            .collect(),
        other => Err(format!("expected an array of outputs, got {other}")),
    }
}

/// Numeric fields of an object reply; anything else is ignored.
fn parse_metrics(value: Value) -> Result<BTreeMap<String, f64>, String> {
    let Value::Object(map) = value else {
        return Err(format!("expected a metric object, got {value}"));
    };
    Ok(map
        .into_iter()
        .filter_map(|(k, v)| v.as_f64().map(|f| (k, f)))
        .collect())
}

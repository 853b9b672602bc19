//! Job orchestrator — runs one job through its phases in order.
//!
//! scan_data → generate_code → train → test. A phase error fails the job on
//! the spot. Cancellation is only observed at checkpoints between worker
//! requests: a request already sent always runs to its reply (or its
//! deadline) first. Either way every worker the job opened is terminated
//! exactly once before the final event is emitted.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use loom_core::config::{LoomConfig, SupervisorConfig};
use loom_core::{
    IterationRecord, JobRecord, JobSpec, JobStatus, PhaseName, RollingAverage, RuntimeSpec,
};

use crate::dataset::{read_dataset, split_tail, DatasetObject};
use crate::hooks::{JobEvent, JobHooks};
use crate::launcher::WorkerLauncher;
use crate::supervisor::{PhaseError, TrainingSupervisor};
use crate::transform::TransformWorker;
use crate::worker::{PendingReply, WorkerLog, WorkerOptions};

// ── Settings / outcome ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Parent of every per-job artifact directory.
    pub work_dir: PathBuf,
    /// Runtime used when the job spec leaves `runtime.program` empty.
    pub runtime_program: String,
    pub runtime_args: Vec<String>,
    /// 0 = adaptive.
    pub rolling_window: usize,
    pub log_tail: usize,
    pub supervisor: SupervisorConfig,
}

impl OrchestratorSettings {
    pub fn from_config(config: &LoomConfig) -> Self {
        Self {
            work_dir: config.runtime.work_dir.clone(),
            runtime_program: config.runtime.program.clone(),
            runtime_args: config.runtime.args.clone(),
            rolling_window: config.jobs.rolling_window,
            log_tail: config.jobs.log_tail,
            supervisor: config.supervisor.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum JobOutcome {
    Complete,
    Failed(String),
    Killed,
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Complete => JobStatus::Complete,
            JobOutcome::Failed(_) => JobStatus::Failed,
            JobOutcome::Killed => JobStatus::Killed,
        }
    }
}

/// Race `fut` against cancellation. Only for local work, never worker requests.
async fn until_cancelled<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, PhaseError>>,
) -> Result<T, PhaseError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PhaseError::Cancelled),
        r = fut => r,
    }
}

// ── Orchestrator ─────────────────────────────────────────────────────────────

pub struct JobOrchestrator {
    record: JobRecord,
    spec: JobSpec,
    settings: OrchestratorSettings,
    launcher: Arc<dyn WorkerLauncher>,
    hooks: Arc<dyn JobHooks>,
    cancel: CancellationToken,
    log_tx: mpsc::UnboundedSender<WorkerLog>,
    log_rx: mpsc::UnboundedReceiver<WorkerLog>,
    train_set: Vec<DatasetObject>,
    test_set: Vec<DatasetObject>,
    supervisor: Option<TrainingSupervisor>,
    transform: Option<TransformWorker>,
    saved_model: Option<PathBuf>,
    /// Last whole percent reported for the current phase.
    progress_pct: u64,
}

impl JobOrchestrator {
    pub fn new(
        record: JobRecord,
        spec: JobSpec,
        settings: OrchestratorSettings,
        launcher: Arc<dyn WorkerLauncher>,
        hooks: Arc<dyn JobHooks>,
        cancel: CancellationToken,
    ) -> Self {
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        Self {
            record,
            spec,
            settings,
            launcher,
            hooks,
            cancel,
            log_tx,
            log_rx,
            train_set: Vec::new(),
            test_set: Vec::new(),
            supervisor: None,
            transform: None,
            saved_model: None,
            progress_pct: 0,
        }
    }

    /// Drive the job to a terminal state and hand back the final record.
    pub async fn run(mut self) -> (JobOutcome, JobRecord) {
        tracing::info!(job_id = %self.record.id, name = %self.spec.name, "job started");
        let mut outcome = JobOutcome::Complete;

        for phase in PhaseName::ALL {
            if self.cancel.is_cancelled() {
                self.record.kill(None);
                outcome = JobOutcome::Killed;
                break;
            }
            self.begin(phase);
            let result = match phase {
                PhaseName::ScanData => self.scan_data().await,
                PhaseName::GenerateCode => self.generate_code().await,
                PhaseName::Train => self.train().await,
                PhaseName::Test => self.test().await,
            };
            match result {
                Ok(()) => self.finish(phase),
                Err(PhaseError::Cancelled) => {
                    self.cleanup(phase).await;
                    tracing::warn!(job_id = %self.record.id, phase = %phase, "job killed");
                    self.record.kill(Some(phase));
                    outcome = JobOutcome::Killed;
                    break;
                }
                Err(e) => {
                    self.cleanup(phase).await;
                    let detail = e.to_string();
                    tracing::error!(job_id = %self.record.id, phase = %phase, error = %detail, "phase failed");
                    self.record.fail_phase(phase, detail.clone());
                    self.emit(JobEvent::PhaseFailed {
                        phase,
                        detail: detail.clone(),
                    });
                    outcome = JobOutcome::Failed(detail);
                    break;
                }
            }
        }

        // Normal completion leaves nothing open, but a killed-before-start job
        // still goes through here.
        self.terminate_workers().await;
        let status = outcome.status();
        tracing::info!(job_id = %self.record.id, status = ?status, "job finished");
        self.emit(JobEvent::Finished { status });
        (outcome, self.record)
    }

    // ── Event plumbing ───────────────────────────────────────────────────────

    fn emit(&self, event: JobEvent) {
        self.hooks.on_event(&self.record, &event);
    }

    fn begin(&mut self, phase: PhaseName) {
        self.progress_pct = 0;
        self.record.begin_phase(phase);
        tracing::info!(job_id = %self.record.id, phase = %phase, "phase started");
        self.emit(JobEvent::PhaseStarted { phase });
    }

    fn finish(&mut self, phase: PhaseName) {
        self.drain_logs(phase);
        self.record.finish_phase(phase);
        tracing::info!(job_id = %self.record.id, phase = %phase, "phase finished");
        self.emit(JobEvent::PhaseFinished { phase });
    }

    /// Report progress, at most once per whole percent.
    fn progress(&mut self, phase: PhaseName, done: usize, total: usize) {
        if total == 0 {
            return;
        }
        let pct = (done as u64 * 100) / total as u64;
        if pct <= self.progress_pct {
            return;
        }
        self.progress_pct = pct;
        let fraction = done as f64 / total as f64;
        self.record.set_progress(phase, fraction);
        self.emit(JobEvent::Progress { phase, fraction });
    }

    fn log(&mut self, phase: PhaseName, line: String) {
        tracing::debug!(job_id = %self.record.id, phase = %phase, "{line}");
        self.record.push_log(line.clone(), self.settings.log_tail);
        self.emit(JobEvent::Log {
            phase: Some(phase),
            line,
        });
    }

    fn drain_logs(&mut self, phase: PhaseName) {
        while let Ok(entry) = self.log_rx.try_recv() {
            self.log(phase, format!("[{}] {}", entry.worker, entry.line));
        }
    }

    /// Between request/response boundaries: observe cancellation and make
    /// sure the phase's workers are still alive.
    fn checkpoint(&mut self, phase: PhaseName) -> Result<(), PhaseError> {
        self.drain_logs(phase);
        if self.cancel.is_cancelled() {
            return Err(PhaseError::Cancelled);
        }
        if let Some(sup) = &self.supervisor {
            sup.check_alive()?;
        }
        if let Some(worker) = &self.transform {
            worker.check_alive()?;
        }
        Ok(())
    }

    async fn cleanup(&mut self, phase: PhaseName) {
        self.terminate_workers().await;
        self.drain_logs(phase);
    }

    async fn terminate_workers(&mut self) {
        if let Some(mut worker) = self.transform.take() {
            worker.terminate().await;
        }
        if let Some(mut sup) = self.supervisor.take() {
            sup.terminate().await;
        }
    }

    // ── Shared helpers ───────────────────────────────────────────────────────

    fn job_dir(&self) -> PathBuf {
        self.settings.work_dir.join(self.record.id.as_str())
    }

    fn worker_options(&self, role: &str) -> WorkerOptions {
        WorkerOptions::from_config(
            format!("{}-{role}", self.record.id),
            &self.settings.supervisor,
        )
        .with_log_channel(self.log_tx.clone())
    }

    fn runtime(&self) -> RuntimeSpec {
        let mut runtime = self.spec.runtime.clone();
        if runtime.program.is_empty() {
            runtime.program = self.settings.runtime_program.clone();
            if runtime.args.is_empty() {
                runtime.args = self.settings.runtime_args.clone();
            }
        }
        runtime
    }

    fn new_supervisor(&self, role: &str) -> TrainingSupervisor {
        TrainingSupervisor::new(
            self.record.id.clone(),
            self.job_dir(),
            self.runtime(),
            self.worker_options(role),
            self.launcher.clone(),
        )
        .with_model_path(self.spec.model_path.clone())
    }

    fn supervisor(&self) -> Result<&TrainingSupervisor, PhaseError> {
        self.supervisor.as_ref().ok_or(PhaseError::OutOfOrder {
            step: "supervisor",
            stage: "missing",
        })
    }

    fn supervisor_mut(&mut self) -> Result<&mut TrainingSupervisor, PhaseError> {
        self.supervisor.as_mut().ok_or(PhaseError::OutOfOrder {
            step: "supervisor",
            stage: "missing",
        })
    }

    /// Load every object with all `load` requests in flight at once.
    async fn load_objects(&self, objects: &[DatasetObject]) -> Result<(), PhaseError> {
        let _in_flight = self.hooks.track_requests(&self.record.id, objects.len());
        let sup = self.supervisor()?;

        let mut pending = Vec::with_capacity(objects.len());
        for obj in objects {
            pending.push(
                sup.load_object(&obj.id, obj.input.clone(), obj.output.clone())
                    .await?,
            );
        }
        let replies =
            futures::future::join_all(pending.into_iter().map(PendingReply::wait)).await;
        for reply in replies {
            reply.map_err(|source| PhaseError::Request {
                step: "load_object",
                source,
            })?;
        }
        Ok(())
    }

    // ── Phases ───────────────────────────────────────────────────────────────

    async fn scan_data(&mut self) -> Result<(), PhaseError> {
        let phase = PhaseName::ScanData;
        let cancel = self.cancel.clone();

        let dataset = self.spec.dataset.clone();
        let mut objects =
            until_cancelled(&cancel, async { Ok(read_dataset(&dataset).await?) }).await?;
        self.log(
            phase,
            format!("read {} objects from {}", objects.len(), dataset.display()),
        );

        if let Some(spec) = self.spec.transform.clone() {
            let options = self.worker_options("transform");
            let dir = self.job_dir();
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| PhaseError::Artifact {
                    step: "start_transform",
                    detail: format!("{}: {e}", dir.display()),
                })?;
            let launcher = self.launcher.clone();
            let worker = TransformWorker::start(launcher.as_ref(), &spec, Some(dir), options)
                .await
                .map_err(|source| PhaseError::Startup {
                    step: "start_transform",
                    source,
                })?;
            self.transform = Some(worker);

            let total = objects.len();
            for (done, obj) in objects.iter_mut().enumerate() {
                self.checkpoint(phase)?;
                let _in_flight = self.hooks.track_requests(&self.record.id, 1);
                let worker = self.transform.as_ref().ok_or(PhaseError::OutOfOrder {
                    step: "transform",
                    stage: "missing",
                })?;
                let input = std::mem::take(&mut obj.input);
                obj.input = worker
                    .transform(input)
                    .await
                    .map_err(|source| PhaseError::Request {
                        step: "transform",
                        source,
                    })?;
                drop(_in_flight);
                self.progress(phase, done + 1, total);
            }

            if let Some(mut worker) = self.transform.take() {
                worker.terminate().await;
            }
            self.log(phase, format!("transformed {total} objects"));
        }

        let (train, test) = split_tail(objects, self.spec.test_fraction);
        self.log(
            phase,
            format!("{} training objects, {} test objects", train.len(), test.len()),
        );
        self.train_set = train;
        self.test_set = test;
        Ok(())
    }

    async fn generate_code(&mut self) -> Result<(), PhaseError> {
        let phase = PhaseName::GenerateCode;
        let mut sup = self.new_supervisor("train");
        let artifact = sup.generate_artifact(&self.spec.architecture).await?;
        self.supervisor = Some(sup);
        self.log(phase, format!("artifact written to {}", artifact.display()));
        Ok(())
    }

    async fn train(&mut self) -> Result<(), PhaseError> {
        let phase = PhaseName::Train;

        self.supervisor_mut()?.start_process().await?;
        self.checkpoint(phase)?;

        if let Some(path) = self.spec.model_path.clone().filter(|p| p.exists()) {
            self.supervisor()?.load_model_state(&path).await?;
            self.log(phase, format!("resumed from {}", path.display()));
        }

        let objects = std::mem::take(&mut self.train_set);
        self.load_objects(&objects).await?;
        self.log(phase, format!("loaded {} objects", objects.len()));
        let ids: Vec<String> = objects.into_iter().map(|o| o.id).collect();

        let iterations = self.spec.iterations;
        let window = self.settings.rolling_window;
        let mut averages: BTreeMap<String, RollingAverage> = BTreeMap::new();

        for index in 0..iterations {
            self.checkpoint(phase)?;
            let metrics = {
                let _in_flight = self.hooks.track_requests(&self.record.id, 1);
                self.supervisor()?.train_iteration(&ids, index).await?
            };

            let mut smoothed = BTreeMap::new();
            for (name, value) in &metrics {
                let avg = averages
                    .entry(name.clone())
                    .or_insert_with(|| RollingAverage::for_run(window, iterations));
                avg.accumulate(*value);
                if let Some(mean) = avg.average() {
                    self.record.push_smoothed(name, mean);
                    smoothed.insert(name.clone(), mean);
                }
            }
            self.record.push_iteration(IterationRecord {
                index,
                metrics: metrics.clone(),
            });
            tracing::debug!(job_id = %self.record.id, iteration = index, ?metrics, "iteration complete");
            self.emit(JobEvent::Iteration {
                index,
                metrics,
                smoothed,
            });
            self.progress(phase, (index + 1) as usize, iterations as usize);
        }

        let model_path = self
            .spec
            .model_path
            .clone()
            .unwrap_or_else(|| self.job_dir().join("model.state"));
        self.checkpoint(phase)?;
        self.supervisor()?.save_model_state(&model_path).await?;
        self.log(phase, format!("model state saved to {}", model_path.display()));
        self.saved_model = Some(model_path);

        if let Some(mut sup) = self.supervisor.take() {
            sup.terminate().await;
        }
        Ok(())
    }

    async fn test(&mut self) -> Result<(), PhaseError> {
        let phase = PhaseName::Test;
        let objects = std::mem::take(&mut self.test_set);

        if objects.is_empty() {
            self.log(phase, "no test objects, skipping evaluation".to_string());
            self.record.set_result("total", 0.0);
            self.emit(JobEvent::Result {
                phase,
                metrics: BTreeMap::from([("total".to_string(), 0.0)]),
            });
            return Ok(());
        }

        // A fresh runtime, so evaluation only sees the saved state.
        let mut sup = self.new_supervisor("test");
        sup.generate_artifact(&self.spec.architecture).await?;
        self.supervisor = Some(sup);
        self.supervisor_mut()?.start_process().await?;
        self.checkpoint(phase)?;

        if let Some(path) = self.saved_model.clone() {
            self.supervisor()?.load_model_state(&path).await?;
        }
        self.load_objects(&objects).await?;
        self.checkpoint(phase)?;

        let ids: Vec<String> = objects.iter().map(|o| o.id.clone()).collect();
        let outputs = {
            let _in_flight = self.hooks.track_requests(&self.record.id, 1);
            self.supervisor()?.process_objects(&ids).await?
        };

        let total = objects.len();
        let correct = outputs
            .iter()
            .zip(&objects)
            .filter(|(predicted, obj)| prediction_matches(predicted, &obj.output))
            .count();
        let accuracy = correct as f64 / total as f64;
        let metrics = BTreeMap::from([
            ("accuracy".to_string(), accuracy),
            ("correct".to_string(), correct as f64),
            ("total".to_string(), total as f64),
        ]);
        for (name, value) in &metrics {
            self.record.set_result(name, *value);
        }
        self.log(
            phase,
            format!("{correct}/{total} correct (accuracy {accuracy:.4})"),
        );
        self.emit(JobEvent::Result { phase, metrics });

        if let Some(mut sup) = self.supervisor.take() {
            sup.terminate().await;
        }
        Ok(())
    }
}

/// Exact match, or the same class: numbers that round alike, one-hot/score
/// vectors with the same argmax, or a score vector whose argmax is the label.
fn prediction_matches(predicted: &Value, expected: &Value) -> bool {
    if predicted == expected {
        return true;
    }
    match (predicted, expected) {
        (Value::Number(p), Value::Number(e)) => match (p.as_f64(), e.as_f64()) {
            (Some(p), Some(e)) => (p - e).abs() < 0.5,
            _ => false,
        },
        (Value::Array(p), Value::Array(e)) if p.len() == e.len() && p.len() > 1 => {
            matches!((argmax(p), argmax(e)), (Some(a), Some(b)) if a == b)
        }
        (Value::Array(p), Value::Number(e)) => {
            matches!((argmax(p), e.as_u64()), (Some(a), Some(b)) if a as u64 == b)
        }
        _ => false,
    }
}

fn argmax(values: &[Value]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .filter_map(|(i, v)| v.as_f64().map(|f| (i, f)))
        .fold(None, |best: Option<(usize, f64)>, (i, f)| match best {
            Some((_, b)) if b >= f => best,
            _ => Some((i, f)),
        })
        .map(|(i, _)| i)
}

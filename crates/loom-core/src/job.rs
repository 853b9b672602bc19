//! Job model — what callers submit and the record the orchestrator keeps.
//!
//! A `JobRecord` is mutated only by the orchestrator run that owns it. All
//! other readers (the observability bridge, HTTP handlers) work on clones.
//! Once the job reaches a terminal status every mutator is a no-op.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Identity ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

static JOB_SEQ: AtomicU64 = AtomicU64::new(0);

impl JobId {
    /// Hex BLAKE3 prefix over name, submit time and a process-wide counter.
    pub fn generate(name: &str) -> Self {
        let mut h = blake3::Hasher::new();
        h.update(name.as_bytes());
        h.update(&now_ms().to_le_bytes());
        h.update(&JOB_SEQ.fetch_add(1, Ordering::Relaxed).to_le_bytes());
        Self(hex::encode(&h.finalize().as_bytes()[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ── Submission ───────────────────────────────────────────────────────────────

/// How to launch the numerical runtime for a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSpec {
    /// Executable. Empty = the daemon's configured default runtime.
    pub program: String,
    /// Arguments; `{artifact}` is replaced with the generated artifact path.
    pub args: Vec<String>,
    /// Artifact template. `None` = the architecture JSON is the artifact.
    pub template: Option<PathBuf>,
    /// File name of the rendered artifact inside the job directory.
    pub artifact_name: Option<String>,
}

/// A user-supplied per-record transform script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    /// JSONL file, one `{"id"?, "input", "output"}` object per line.
    pub dataset: PathBuf,
    /// Network description rendered into the runtime artifact.
    #[serde(default)]
    pub architecture: serde_json::Value,
    #[serde(default)]
    pub runtime: RuntimeSpec,
    #[serde(default)]
    pub transform: Option<TransformSpec>,
    #[serde(default = "default_iterations")]
    pub iterations: u64,
    /// Fraction of the dataset (taken from the tail) held out for `test`.
    #[serde(default = "default_test_fraction")]
    pub test_fraction: f64,
    /// Model state location. Loaded before training if present, always saved after.
    #[serde(default)]
    pub model_path: Option<PathBuf>,
}

fn default_iterations() -> u64 {
    10
}

fn default_test_fraction() -> f64 {
    0.2
}

impl JobSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name is required".into());
        }
        if self.dataset.as_os_str().is_empty() {
            return Err("dataset path is required".into());
        }
        if self.iterations == 0 {
            return Err("iterations must be >= 1".into());
        }
        if !(0.0..1.0).contains(&self.test_fraction) {
            return Err("test_fraction must be in [0, 1)".into());
        }
        Ok(())
    }
}

// ── Status ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    ScanData,
    GenerateCode,
    Train,
    Test,
}

impl PhaseName {
    /// Execution order.
    pub const ALL: [PhaseName; 4] = [
        PhaseName::ScanData,
        PhaseName::GenerateCode,
        PhaseName::Train,
        PhaseName::Test,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PhaseName::ScanData => "scan_data",
            PhaseName::GenerateCode => "generate_code",
            PhaseName::Train => "train",
            PhaseName::Test => "test",
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for PhaseName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Waiting,
    InProgress,
    Complete,
    Failed,
    Killed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    InProgress,
    Complete,
    Failed,
    Killed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed | JobStatus::Killed)
    }
}

// ── Record ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub name: PhaseName,
    pub status: PhaseStatus,
    /// Fraction complete, 0.0..=1.0.
    pub progress: f64,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub index: u64,
    pub metrics: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub phases: Vec<PhaseRecord>,
    /// Raw per-iteration metrics, append-only.
    pub iterations: Vec<IterationRecord>,
    /// Rolling-average series per metric, one point per iteration.
    pub smoothed: BTreeMap<String, Vec<f64>>,
    /// Final metrics reported by phases (e.g. test accuracy).
    pub results: BTreeMap<String, f64>,
    /// Most recent log lines, oldest first.
    pub logs: Vec<String>,
    pub current_phase: Option<usize>,
    pub submitted_at: u64,
    pub updated_at: u64,
}

impl JobRecord {
    /// Fresh record with every phase `waiting`.
    pub fn new(id: JobId, name: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id,
            name: name.into(),
            status: JobStatus::Waiting,
            phases: PhaseName::ALL
                .iter()
                .map(|name| PhaseRecord {
                    name: *name,
                    status: PhaseStatus::Waiting,
                    progress: 0.0,
                    started_at: None,
                    finished_at: None,
                    error: None,
                })
                .collect(),
            iterations: Vec::new(),
            smoothed: BTreeMap::new(),
            results: BTreeMap::new(),
            logs: Vec::new(),
            current_phase: None,
            submitted_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn phase(&self, name: PhaseName) -> &PhaseRecord {
        &self.phases[name.index()]
    }

    fn touch(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.updated_at = now_ms();
        true
    }

    pub fn begin_phase(&mut self, name: PhaseName) {
        if !self.touch() {
            return;
        }
        let now = self.updated_at;
        let phase = &mut self.phases[name.index()];
        phase.status = PhaseStatus::InProgress;
        phase.progress = 0.0;
        phase.started_at = Some(now);
        self.current_phase = Some(name.index());
        self.status = JobStatus::InProgress;
    }

    pub fn set_progress(&mut self, name: PhaseName, fraction: f64) {
        if !self.touch() {
            return;
        }
        let fraction = if fraction.is_finite() { fraction.clamp(0.0, 1.0) } else { 0.0 };
        self.phases[name.index()].progress = fraction;
    }

    /// Marks the phase complete; completing the last phase completes the job.
    pub fn finish_phase(&mut self, name: PhaseName) {
        if !self.touch() {
            return;
        }
        let now = self.updated_at;
        let phase = &mut self.phases[name.index()];
        phase.status = PhaseStatus::Complete;
        phase.progress = 1.0;
        phase.finished_at = Some(now);
        if name.index() + 1 == self.phases.len() {
            self.status = JobStatus::Complete;
            self.current_phase = None;
        }
    }

    pub fn fail_phase(&mut self, name: PhaseName, detail: impl Into<String>) {
        if !self.touch() {
            return;
        }
        let now = self.updated_at;
        let phase = &mut self.phases[name.index()];
        phase.status = PhaseStatus::Failed;
        phase.finished_at = Some(now);
        phase.error = Some(detail.into());
        self.status = JobStatus::Failed;
    }

    /// Kill the job. The phase in progress (if any) is marked killed too.
    pub fn kill(&mut self, name: Option<PhaseName>) {
        if !self.touch() {
            return;
        }
        let now = self.updated_at;
        if let Some(name) = name {
            let phase = &mut self.phases[name.index()];
            phase.status = PhaseStatus::Killed;
            phase.finished_at = Some(now);
        }
        self.status = JobStatus::Killed;
    }

    pub fn push_iteration(&mut self, iteration: IterationRecord) {
        if self.touch() {
            self.iterations.push(iteration);
        }
    }

    pub fn push_smoothed(&mut self, metric: &str, value: f64) {
        if self.touch() {
            self.smoothed.entry(metric.to_string()).or_default().push(value);
        }
    }

    pub fn set_result(&mut self, metric: &str, value: f64) {
        if self.touch() {
            self.results.insert(metric.to_string(), value);
        }
    }

    /// Append a log line, keeping at most `cap` lines.
    pub fn push_log(&mut self, line: impl Into<String>, cap: usize) {
        if !self.touch() {
            return;
        }
        self.logs.push(line.into());
        if self.logs.len() > cap {
            let excess = self.logs.len() - cap;
            self.logs.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> JobSpec {
        serde_json::from_value(serde_json::json!({
            "name": "mnist",
            "dataset": "/data/mnist.jsonl"
        }))
        .unwrap()
    }

    #[test]
    fn spec_defaults_fill_in() {
        let s = spec();
        assert_eq!(s.iterations, 10);
        assert!((s.test_fraction - 0.2).abs() < f64::EPSILON);
        assert!(s.transform.is_none());
        assert!(s.runtime.program.is_empty());
        assert!(s.validate().is_ok());
    }

    #[test]
    fn spec_rejects_bad_fraction() {
        let mut s = spec();
        s.test_fraction = 1.0;
        assert!(s.validate().is_err());
        s.test_fraction = 0.1;
        s.iterations = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn new_record_has_all_phases_waiting() {
        let r = JobRecord::new(JobId::from("j1"), "mnist");
        assert_eq!(r.status, JobStatus::Waiting);
        let names: Vec<_> = r.phases.iter().map(|p| p.name).collect();
        assert_eq!(names, PhaseName::ALL.to_vec());
        assert!(r.phases.iter().all(|p| p.status == PhaseStatus::Waiting));
    }

    #[test]
    fn finishing_last_phase_completes_job() {
        let mut r = JobRecord::new(JobId::from("j1"), "mnist");
        for name in PhaseName::ALL {
            r.begin_phase(name);
            assert_eq!(r.current_phase, Some(name.index()));
            r.finish_phase(name);
        }
        assert_eq!(r.status, JobStatus::Complete);
        assert!(r.phases.iter().all(|p| p.status == PhaseStatus::Complete));
    }

    #[test]
    fn terminal_record_is_frozen() {
        let mut r = JobRecord::new(JobId::from("j1"), "mnist");
        r.begin_phase(PhaseName::ScanData);
        r.fail_phase(PhaseName::ScanData, "dataset missing");
        let frozen = r.clone();

        r.begin_phase(PhaseName::GenerateCode);
        r.push_log("late", 10);
        r.kill(Some(PhaseName::GenerateCode));
        assert_eq!(r, frozen);
        assert_eq!(r.status, JobStatus::Failed);
    }

    #[test]
    fn progress_is_clamped() {
        let mut r = JobRecord::new(JobId::from("j1"), "mnist");
        r.begin_phase(PhaseName::Train);
        r.set_progress(PhaseName::Train, 1.7);
        assert_eq!(r.phase(PhaseName::Train).progress, 1.0);
        r.set_progress(PhaseName::Train, f64::NAN);
        assert_eq!(r.phase(PhaseName::Train).progress, 0.0);
    }

    #[test]
    fn log_tail_is_bounded() {
        let mut r = JobRecord::new(JobId::from("j1"), "mnist");
        for i in 0..5 {
            r.push_log(format!("line {i}"), 3);
        }
        assert_eq!(r.logs, vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn generated_ids_are_distinct() {
        let a = JobId::generate("same");
        let b = JobId::generate("same");
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 16);
    }
}

//! Configuration system for Loom.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $LOOM_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/loom/config.toml
//!   3. ~/.config/loom/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::codec::DEFAULT_MAX_LINE_BYTES;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoomConfig {
    pub supervisor: SupervisorConfig,
    pub runtime: RuntimeConfig,
    pub jobs: JobsConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Max wait for a worker's handshake reply.
    pub handshake_timeout_ms: u64,
    /// Per-request deadline. 0 = no deadline.
    pub request_timeout_ms: u64,
    /// How long `kill()` waits after SIGTERM before forcing SIGKILL.
    pub kill_grace_ms: u64,
    /// How long to wait for an exit status after the worker's stdout closes.
    pub exit_grace_ms: u64,
    /// Longest accepted protocol line.
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Default runtime executable when a job does not name one.
    pub program: String,
    /// Default runtime arguments; `{artifact}` is substituted.
    pub args: Vec<String>,
    /// Root for per-job artifact directories.
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Max jobs running at once. 0 = available parallelism.
    pub max_concurrent_jobs: u32,
    /// Rolling-average window for metric smoothing. 0 = adaptive.
    pub rolling_window: usize,
    /// Log lines retained per job record.
    pub log_tail: usize,
    /// Where terminal job records are written.
    pub records_dir: PathBuf,
    /// Queue depth for submitted-but-not-started jobs.
    pub queue_capacity: usize,
    /// Finished jobs kept in memory; older ones are read from `records_dir`.
    /// 0 = keep all.
    pub retain_finished: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// HTTP control-plane port on 127.0.0.1.
    pub port: u16,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            request_timeout_ms: 0,
            kill_grace_ms: 2_000,
            exit_grace_ms: 1_000,
            max_frame_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            program: "loom-worker".to_string(),
            args: vec!["train".to_string(), "{artifact}".to_string()],
            work_dir: data_dir().join("work"),
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 0,
            rolling_window: 0,
            log_tail: 200,
            records_dir: data_dir().join("records"),
            queue_capacity: 64,
            retain_finished: 100,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 9101 }
    }
}

impl SupervisorConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.exit_grace_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("loom")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("loom")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl LoomConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            LoomConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("LOOM_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&LoomConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply LOOM_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        fn parse<T: std::str::FromStr>(v: Option<String>) -> Option<T> {
            v.and_then(|s| s.trim().parse().ok())
        }

        if let Some(v) = parse(get("LOOM_SUPERVISOR__HANDSHAKE_TIMEOUT_MS")) {
            self.supervisor.handshake_timeout_ms = v;
        }
        if let Some(v) = parse(get("LOOM_SUPERVISOR__REQUEST_TIMEOUT_MS")) {
            self.supervisor.request_timeout_ms = v;
        }
        if let Some(v) = get("LOOM_RUNTIME__PROGRAM") {
            self.runtime.program = v;
        }
        if let Some(v) = get("LOOM_RUNTIME__WORK_DIR") {
            self.runtime.work_dir = PathBuf::from(v);
        }
        if let Some(v) = parse(get("LOOM_JOBS__MAX_CONCURRENT_JOBS")) {
            self.jobs.max_concurrent_jobs = v;
        }
        if let Some(v) = parse(get("LOOM_JOBS__ROLLING_WINDOW")) {
            self.jobs.rolling_window = v;
        }
        if let Some(v) = parse(get("LOOM_JOBS__RETAIN_FINISHED")) {
            self.jobs.retain_finished = v;
        }
        if let Some(v) = get("LOOM_JOBS__RECORDS_DIR") {
            self.jobs.records_dir = PathBuf::from(v);
        }
        if let Some(v) = parse(get("LOOM_API__PORT")) {
            self.api.port = v;
        }
    }
}

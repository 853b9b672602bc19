//! Job record persistence. Only terminal records are written; the daemon
//! reloads them at startup so finished jobs stay visible.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use loom_core::{JobId, JobRecord};

#[derive(Debug, thiserror::Error)]
pub enum RecordStoreError {
    #[error("record store i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("record {path} is not valid JSON: {source}")]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn save(&self, record: &JobRecord) -> Result<(), RecordStoreError>;
    async fn load(&self, id: &JobId) -> Result<Option<JobRecord>, RecordStoreError>;
    async fn list(&self) -> Result<Vec<JobRecord>, RecordStoreError>;
}

/// One `<id>.json` file per record.
#[derive(Debug, Clone)]
pub struct FileRecordStore {
    dir: PathBuf,
}

impl FileRecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `None` for ids that could escape the directory.
    fn path_for(&self, id: &JobId) -> Option<PathBuf> {
        let safe = !id.as_str().is_empty()
            && id
                .as_str()
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        safe.then(|| self.dir.join(format!("{}.json", id.as_str())))
    }

    fn io(path: &Path) -> impl FnOnce(std::io::Error) -> RecordStoreError + '_ {
        move |source| RecordStoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    async fn read(path: &Path) -> Result<JobRecord, RecordStoreError> {
        let bytes = tokio::fs::read(path).await.map_err(Self::io(path))?;
        serde_json::from_slice(&bytes).map_err(|source| RecordStoreError::Serde {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn save(&self, record: &JobRecord) -> Result<(), RecordStoreError> {
        let Some(path) = self.path_for(&record.id) else {
            tracing::warn!(job_id = %record.id, "refusing to persist record with unsafe id");
            return Ok(());
        };
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(Self::io(&self.dir))?;
        let json = serde_json::to_vec_pretty(record).map_err(|source| RecordStoreError::Serde {
            path: path.clone(),
            source,
        })?;
        // Write-then-rename so readers never see a partial file.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await.map_err(Self::io(&tmp))?;
        tokio::fs::rename(&tmp, &path).await.map_err(Self::io(&path))?;
        tracing::debug!(job_id = %record.id, path = %path.display(), "record saved");
        Ok(())
    }

    async fn load(&self, id: &JobId) -> Result<Option<JobRecord>, RecordStoreError> {
        let Some(path) = self.path_for(id) else {
            return Ok(None);
        };
        match tokio::fs::try_exists(&path).await {
            Ok(true) => Self::read(&path).await.map(Some),
            Ok(false) => Ok(None),
            Err(e) => Err(Self::io(&path)(e)),
        }
    }

    /// Unreadable files are skipped with a warning.
    async fn list(&self) -> Result<Vec<JobRecord>, RecordStoreError> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::io(&self.dir)(e)),
        };
        let mut records = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(Self::io(&self.dir))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read(&path).await {
                Ok(r) => records.push(r),
                Err(e) => tracing::warn!(error = %e, "skipping unreadable job record"),
            }
        }
        records.sort_by_key(|r| r.submitted_at);
        Ok(records)
    }
}

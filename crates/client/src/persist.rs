// crates/client/src/persist.rs
//! Remembers which job the client is tracking, so a restarted client can
//! resume it.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use docjobs_core::JobId;
use serde::{Deserialize, Serialize};

use crate::error::ClientResult;

#[async_trait]
pub trait TrackedJobStore: Send + Sync {
    async fn load(&self) -> ClientResult<Option<JobId>>;

    async fn save(&self, job_id: &str) -> ClientResult<()>;

    /// Forget `job_id` if it is the one stored. Another id is left alone.
    async fn clear(&self, job_id: &str) -> ClientResult<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct TrackedFile {
    job_id: JobId,
}

/// One small JSON file, by default in the user's data directory.
#[derive(Debug, Clone)]
pub struct FileTrackedJobStore {
    path: PathBuf,
}

impl FileTrackedJobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data dir>/docjobs/tracked_job.json`, if the platform has a data dir.
    pub fn default_location() -> Option<Self> {
        dirs::data_dir().map(|dir| Self::new(dir.join("docjobs").join("tracked_job.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TrackedJobStore for FileTrackedJobStore {
    async fn load(&self) -> ClientResult<Option<JobId>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<TrackedFile>(&raw) {
            Ok(file) if !file.job_id.is_empty() => Ok(Some(file.job_id)),
            Ok(_) => Ok(None),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "ignoring unreadable tracked job file");
                Ok(None)
            }
        }
    }

    async fn save(&self, job_id: &str) -> ClientResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec(&TrackedFile {
            job_id: job_id.to_string(),
        })
        .map_err(|e| crate::error::ClientError::Decode(e.to_string()))?;
        tokio::fs::write(&self.path, body).await?;
        Ok(())
    }

    async fn clear(&self, job_id: &str) -> ClientResult<()> {
        if self.load().await?.as_deref() != Some(job_id) {
            return Ok(());
        }
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryTrackedJobStore {
    current: Mutex<Option<JobId>>,
}

impl MemoryTrackedJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job(job_id: impl Into<JobId>) -> Self {
        Self {
            current: Mutex::new(Some(job_id.into())),
        }
    }

    fn with_current<T>(&self, f: impl FnOnce(&mut Option<JobId>) -> T) -> T {
        match self.current.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => {
                tracing::error!("tracked job mutex poisoned; recovering");
                f(&mut poisoned.into_inner())
            }
        }
    }
}

#[async_trait]
impl TrackedJobStore for MemoryTrackedJobStore {
    async fn load(&self) -> ClientResult<Option<JobId>> {
        Ok(self.with_current(|current| current.clone()))
    }

    async fn save(&self, job_id: &str) -> ClientResult<()> {
        self.with_current(|current| *current = Some(job_id.to_string()));
        Ok(())
    }

    async fn clear(&self, job_id: &str) -> ClientResult<()> {
        self.with_current(|current| {
            if current.as_deref() == Some(job_id) {
                *current = None;
            }
        });
        Ok(())
    }
}

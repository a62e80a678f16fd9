// crates/server/src/jobs/sweeper.rs
//! Retention: evicts old job records, their topics and their directories.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::bus::EventBus;
use super::store::JobStore;

pub const FIRST_SWEEP_DELAY: Duration = Duration::from_secs(10);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Directories under the output root that are never swept.
const KEEP_DIRS: &[&str] = &["logs"];

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub records: usize,
    pub dirs: usize,
}

pub struct Sweeper {
    store: Arc<JobStore>,
    bus: Arc<EventBus>,
    output_root: PathBuf,
    ttl: Duration,
}

impl Sweeper {
    pub fn new(store: Arc<JobStore>, bus: Arc<EventBus>, output_root: PathBuf, ttl: Duration) -> Self {
        Self {
            store,
            bus,
            output_root,
            ttl,
        }
    }

    /// Evict everything older than the TTL once.
    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();

        let cutoff = chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl));
        let expired = cutoff
            .map(|cutoff| self.store.created_before(cutoff))
            .unwrap_or_default();
        for job_id in expired {
            self.store.remove(&job_id);
            self.bus.close(&job_id);
            report.records += 1;
            tracing::debug!(job_id = %job_id, "evicted expired job");
        }

        match self.expired_dirs().await {
            Ok(dirs) => {
                for dir in dirs {
                    match tokio::fs::remove_dir_all(&dir).await {
                        Ok(()) => report.dirs += 1,
                        Err(e) => {
                            tracing::warn!(path = %dir.display(), error = %e, "failed to remove expired job dir")
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.output_root.display(), error = %e, "failed to scan output root")
            }
        }

        if report != SweepReport::default() {
            tracing::info!(records = report.records, dirs = report.dirs, "retention sweep");
        }
        report
    }

    async fn expired_dirs(&self) -> std::io::Result<Vec<PathBuf>> {
        let now = SystemTime::now();
        let mut expired = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.output_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_dir() || is_kept(&path) {
                continue;
            }
            let modified = entry.metadata().await?.modified()?;
            let age = now.duration_since(modified).unwrap_or_default();
            if age > self.ttl {
                expired.push(path);
            }
        }
        Ok(expired)
    }

    /// Sweep after [`FIRST_SWEEP_DELAY`], then every [`SWEEP_INTERVAL`],
    /// until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(FIRST_SWEEP_DELAY) => {}
            }
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        self.sweep_once().await;
                    }
                }
            }
        })
    }
}

fn is_kept(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| KEEP_DIRS.contains(&n))
}

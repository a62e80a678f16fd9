// crates/server/src/jobs/store.rs
//! In-memory store of live job records.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use docjobs_core::{JobId, JobRecord, TransitionError};

/// One job's record plus where its files live.
pub struct JobSlot {
    record: RwLock<JobRecord>,
    job_dir: PathBuf,
}

impl JobSlot {
    fn new(record: JobRecord, job_dir: PathBuf) -> Self {
        Self {
            record: RwLock::new(record),
            job_dir,
        }
    }

    pub fn job_dir(&self) -> &Path {
        &self.job_dir
    }

    /// Where the uploaded document was written.
    pub fn input_path(&self) -> PathBuf {
        self.job_dir.join(self.snapshot().source_name)
    }

    /// Copy of the current record.
    pub fn snapshot(&self) -> JobRecord {
        match self.record.read() {
            Ok(rec) => rec.clone(),
            Err(poisoned) => {
                tracing::error!("RwLock poisoned reading job record");
                poisoned.into_inner().clone()
            }
        }
    }

    /// Apply a guarded mutation and return the resulting record.
    ///
    /// The record is left untouched when `f` rejects the change.
    pub fn update<F>(&self, f: F) -> Result<JobRecord, TransitionError>
    where
        F: FnOnce(&mut JobRecord) -> Result<(), TransitionError>,
    {
        let mut guard = match self.record.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("RwLock poisoned writing job record");
                poisoned.into_inner()
            }
        };
        let mut next = guard.clone();
        f(&mut next)?;
        *guard = next;
        Ok(guard.clone())
    }
}

/// Live records keyed by job id. Injected through `AppState`.
#[derive(Default)]
pub struct JobStore {
    jobs: RwLock<HashMap<JobId, Arc<JobSlot>>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: JobRecord, job_dir: PathBuf) -> Arc<JobSlot> {
        let id = record.job_id.clone();
        let slot = Arc::new(JobSlot::new(record, job_dir));
        match self.jobs.write() {
            Ok(mut jobs) => {
                jobs.insert(id, Arc::clone(&slot));
            }
            Err(e) => tracing::error!("RwLock poisoned writing jobs map: {e}"),
        }
        slot
    }

    pub fn get(&self, id: &str) -> Option<Arc<JobSlot>> {
        match self.jobs.read() {
            Ok(jobs) => jobs.get(id).cloned(),
            Err(e) => {
                tracing::error!("RwLock poisoned reading jobs map: {e}");
                None
            }
        }
    }

    pub fn snapshot(&self, id: &str) -> Option<JobRecord> {
        self.get(id).map(|slot| slot.snapshot())
    }

    /// Non-terminal jobs, newest first.
    pub fn active(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self
            .all_slots()
            .iter()
            .map(|slot| slot.snapshot())
            .filter(|rec| !rec.is_terminal())
            .collect();
        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.job_id.cmp(&a.job_id))
        });
        records
    }

    /// Ids of jobs created before `cutoff`.
    pub fn created_before(&self, cutoff: DateTime<Utc>) -> Vec<JobId> {
        self.all_slots()
            .iter()
            .map(|slot| slot.snapshot())
            .filter(|rec| rec.created_at < cutoff)
            .map(|rec| rec.job_id)
            .collect()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<JobSlot>> {
        match self.jobs.write() {
            Ok(mut jobs) => jobs.remove(id),
            Err(e) => {
                tracing::error!("RwLock poisoned writing jobs map: {e}");
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        match self.jobs.read() {
            Ok(jobs) => jobs.len(),
            Err(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn all_slots(&self) -> Vec<Arc<JobSlot>> {
        match self.jobs.read() {
            Ok(jobs) => jobs.values().cloned().collect(),
            Err(e) => {
                tracing::error!("RwLock poisoned reading jobs map: {e}");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docjobs_core::Stage;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_insert_get_remove() {
        let store = JobStore::new();
        store.insert(JobRecord::new("j1", "a.pdf", t(0)), PathBuf::from("/out/j1"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("j1").unwrap().job_dir(), Path::new("/out/j1"));
        assert!(store.remove("j1").is_some());
        assert!(store.snapshot("j1").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_rejected_update_leaves_record_untouched() {
        let store = JobStore::new();
        let slot = store.insert(JobRecord::new("j1", "a.pdf", t(0)), PathBuf::new());
        slot.update(|rec| rec.advance(Stage::Convert, 40, t(1))).unwrap();

        let err = slot
            .update(|rec| {
                rec.advance(Stage::Convert, 60, t(2))?;
                rec.advance(Stage::Prepare, 70, t(3))
            })
            .unwrap_err();
        assert!(matches!(err, TransitionError::Backward { .. }));

        let rec = slot.snapshot();
        assert_eq!(rec.percent, 40);
        assert_eq!(rec.updated_at, t(1));
    }

    #[test]
    fn test_active_excludes_terminal_and_sorts_newest_first() {
        let store = JobStore::new();
        store.insert(JobRecord::new("old", "a.pdf", t(0)), PathBuf::new());
        store.insert(JobRecord::new("new", "b.pdf", t(10)), PathBuf::new());
        let done = store.insert(JobRecord::new("done", "c.pdf", t(5)), PathBuf::new());
        done.update(|rec| rec.succeed("/x.md", t(6))).unwrap();

        let ids: Vec<_> = store.active().into_iter().map(|r| r.job_id).collect();
        assert_eq!(ids, vec!["new", "old"]);
    }

    #[test]
    fn test_created_before() {
        let store = JobStore::new();
        store.insert(JobRecord::new("a", "a.pdf", t(0)), PathBuf::new());
        store.insert(JobRecord::new("b", "b.pdf", t(100)), PathBuf::new());
        assert_eq!(store.created_before(t(50)), vec!["a".to_string()]);
    }
}

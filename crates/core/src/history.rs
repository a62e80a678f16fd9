// crates/core/src/history.rs
//! Completed-job history rebuilt from the durable event log.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event_log::HistoryRecord;

pub const DEFAULT_HISTORY_LIMIT: usize = 200;
pub const MAX_HISTORY_LIMIT: usize = 2000;

/// Bounds and filter for a history read.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    /// Case-insensitive substring over id, filename, backend and user.
    #[serde(default)]
    pub q: Option<String>,
}

impl HistoryQuery {
    /// Requested limit clamped to `1..=2000`, 200 when absent.
    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT)
    }

    fn needle(&self) -> Option<String> {
        self.q
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_lowercase)
    }
}

/// One successfully completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub job_id: String,
    pub source_name: Option<String>,
    pub backend: Option<String>,
    pub mode: Option<String>,
    pub user: Option<String>,
    pub result_path: Option<String>,
    pub elapsed_ms: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl HistoryRow {
    fn matches(&self, needle: &str) -> bool {
        let fields = [
            Some(self.job_id.as_str()),
            self.source_name.as_deref(),
            self.backend.as_deref(),
            self.user.as_deref(),
        ];
        fields
            .into_iter()
            .flatten()
            .any(|f| f.to_lowercase().contains(needle))
    }
}

/// Fields gathered from `convert.start` records.
#[derive(Default)]
struct StartInfo {
    source_name: Option<String>,
    backend: Option<String>,
    mode: Option<String>,
    user: Option<String>,
    started_at: Option<DateTime<Utc>>,
}

impl StartInfo {
    /// Fill only what is still missing, so the earliest record wins per field.
    fn absorb(&mut self, record: &HistoryRecord) {
        fill(&mut self.source_name, &record.pdf);
        fill(&mut self.backend, &record.backend);
        fill(&mut self.mode, &record.mode);
        fill(&mut self.user, &record.user);
        fill(&mut self.started_at, &record.ts);
    }
}

fn fill<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
    if slot.is_none() {
        slot.clone_from(value);
    }
}

/// Join `convert.done ok=true` records to their `convert.start` records.
///
/// `records` is in log order. Records of other types, failed outcomes and
/// records without a job id are ignored. A job with several success records
/// yields one row, from the latest of them.
pub fn aggregate(records: &[HistoryRecord], query: &HistoryQuery) -> Vec<HistoryRow> {
    let mut starts: HashMap<&str, StartInfo> = HashMap::new();
    let mut dones: HashMap<&str, &HistoryRecord> = HashMap::new();

    for record in records {
        let Some(job_id) = record.job_id.as_deref() else {
            continue;
        };
        if record.is_start() {
            starts.entry(job_id).or_default().absorb(record);
        } else if record.is_success() {
            dones.insert(job_id, record);
        }
    }

    let mut rows: Vec<HistoryRow> = dones
        .into_iter()
        .map(|(job_id, done)| {
            let start = starts.remove(job_id).unwrap_or_default();
            HistoryRow {
                job_id: job_id.to_string(),
                source_name: start.source_name,
                backend: start.backend.or_else(|| done.backend.clone()),
                mode: start.mode.or_else(|| done.mode.clone()),
                user: start.user.or_else(|| done.user.clone()),
                result_path: done.md.clone(),
                elapsed_ms: done.elapsed_ms,
                started_at: start.started_at,
                finished_at: done.ts,
            }
        })
        .collect();

    if let Some(needle) = query.needle() {
        rows.retain(|row| row.matches(&needle));
    }

    // Newest first; ids are timestamp-prefixed so they break ties stably.
    rows.sort_by(|a, b| {
        b.finished_at
            .cmp(&a.finished_at)
            .then_with(|| b.job_id.cmp(&a.job_id))
    });
    rows.truncate(query.effective_limit());
    rows
}

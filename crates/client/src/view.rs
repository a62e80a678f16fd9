// crates/client/src/view.rs
//! Client-side reconciliation of a job record.
//!
//! A [`JobView`] is rebuilt by folding [`StateUpdate`]s from any source,
//! stream or poll, in any order. The fold is commutative and idempotent:
//! - `stage` takes the highest rank, `percent`, `elapsed_ms` and
//!   `updated_at` take the max;
//! - `ok` moves from unknown to a value once and then pins the stage to
//!   the matching terminal with `percent = 100`;
//! - text fields are filled when missing, otherwise the newer update wins;
//! - a field missing from an update never clears anything.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use docjobs_core::{JobEvent, JobId, JobRecord, LogLevel, LogLine, Stage, StateUpdate};
use serde::Serialize;

pub const DEFAULT_LOG_CAPACITY: usize = 400;

/// Where a tracker is in its synchronization lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Connecting,
    Streaming,
    /// The stream is down; snapshots keep the view current.
    Polling,
    /// Final: outcome known, job lost, or nothing more to do.
    Settled,
}

/// One diagnostic line kept for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub ts: DateTime<Utc>,
    pub level: LogLevel,
    /// `None` for entries the client produced itself.
    pub stage: Option<Stage>,
    pub message: String,
}

impl From<&LogLine> for LogEntry {
    fn from(line: &LogLine) -> Self {
        Self {
            ts: line.ts,
            level: line.level,
            stage: Some(line.stage),
            message: line.message.clone(),
        }
    }
}

/// Fixed-capacity buffer of the most recent log entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRing {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    dropped: u64,
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            dropped: 0,
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.dropped += 1;
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries evicted to make room.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&LogEntry> {
        self.entries.back()
    }
}

/// A text value plus the timestamp of the update that supplied it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Stamped {
    ts: DateTime<Utc>,
    value: String,
}

fn merge_text(slot: &mut Option<Stamped>, value: Option<&String>, ts: DateTime<Utc>) {
    let Some(value) = value else {
        return;
    };
    // Ties on `ts` go to the larger value so the result is order-free.
    let newer = match slot {
        None => true,
        Some(current) => (ts, value.as_str()) > (current.ts, current.value.as_str()),
    };
    if newer {
        *slot = Some(Stamped {
            ts,
            value: value.clone(),
        });
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Merged {
    stage: Option<Stage>,
    percent: u8,
    ok: Option<bool>,
    error: Option<Stamped>,
    result_path: Option<Stamped>,
    source_name: Option<Stamped>,
    elapsed_ms: Option<u64>,
    updated_at: Option<DateTime<Utc>>,
}

impl Merged {
    fn apply(&mut self, update: &StateUpdate) {
        if self.ok.is_none() {
            self.ok = update.ok;
        }

        self.stage = match (self.stage, update.stage) {
            (Some(a), Some(b)) => Some(if b.rank() > a.rank() { b } else { a }),
            (a, b) => a.or(b),
        };
        if let Some(percent) = update.percent {
            self.percent = self.percent.max(percent.min(100));
        }
        self.elapsed_ms = self.elapsed_ms.max(update.elapsed_ms);
        self.updated_at = self.updated_at.max(Some(update.ts));

        merge_text(&mut self.error, update.error.as_ref(), update.ts);
        merge_text(&mut self.result_path, update.result_path.as_ref(), update.ts);
        merge_text(&mut self.source_name, update.source_name.as_ref(), update.ts);

        match self.ok {
            Some(true) => {
                self.stage = Some(Stage::Done);
                self.percent = 100;
            }
            Some(false) => {
                self.stage = Some(Stage::Error);
                self.percent = 100;
            }
            None => {}
        }
    }
}

/// Local reconciliation of one job's record.
#[derive(Debug, Clone, PartialEq)]
pub struct JobView {
    job_id: JobId,
    merged: Merged,
    phase: SyncPhase,
    lost: bool,
    logs: LogRing,
}

impl JobView {
    pub fn new(job_id: impl Into<JobId>) -> Self {
        Self::with_log_capacity(job_id, DEFAULT_LOG_CAPACITY)
    }

    pub fn with_log_capacity(job_id: impl Into<JobId>, capacity: usize) -> Self {
        Self {
            job_id: job_id.into(),
            merged: Merged::default(),
            phase: SyncPhase::Connecting,
            lost: false,
            logs: LogRing::new(capacity),
        }
    }

    /// Fold a state update in. Returns whether anything visible changed.
    /// Updates for another job are ignored.
    pub fn apply(&mut self, update: &StateUpdate) -> bool {
        if update.job_id != self.job_id {
            tracing::debug!(expected = %self.job_id, got = %update.job_id, "ignoring update for another job");
            return false;
        }
        let before = self.merged.clone();
        self.merged.apply(update);
        self.merged != before
    }

    pub fn apply_record(&mut self, record: &JobRecord) -> bool {
        self.apply(&record.to_update())
    }

    /// Fold any event: state-bearing ones merge, log lines go to the ring.
    pub fn apply_event(&mut self, event: &JobEvent) -> bool {
        match event {
            JobEvent::Snapshot(update) | JobEvent::Progress(update) => self.apply(update),
            JobEvent::Log(line) if line.job_id == self.job_id => {
                self.logs.push(LogEntry::from(line));
                true
            }
            JobEvent::Log(_) => false,
        }
    }

    /// Record a client-side diagnostic in the log ring.
    pub fn note(&mut self, level: LogLevel, message: impl Into<String>) {
        self.logs.push(LogEntry {
            ts: Utc::now(),
            level,
            stage: None,
            message: message.into(),
        });
    }

    /// Move to `phase`. `Settled` is final.
    pub fn set_phase(&mut self, phase: SyncPhase) -> bool {
        if self.phase == SyncPhase::Settled || self.phase == phase {
            return false;
        }
        self.phase = phase;
        true
    }

    /// The server no longer knows this job. Only meaningful while the
    /// outcome is unknown.
    pub fn mark_lost(&mut self) -> bool {
        if self.merged.ok.is_some() || self.lost {
            return false;
        }
        self.lost = true;
        self.phase = SyncPhase::Settled;
        true
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn stage(&self) -> Stage {
        self.merged.stage.unwrap_or_default()
    }

    pub fn percent(&self) -> u8 {
        self.merged.percent
    }

    pub fn ok(&self) -> Option<bool> {
        self.merged.ok
    }

    pub fn error(&self) -> Option<&str> {
        self.merged.error.as_ref().map(|s| s.value.as_str())
    }

    pub fn result_path(&self) -> Option<&str> {
        self.merged.result_path.as_ref().map(|s| s.value.as_str())
    }

    pub fn source_name(&self) -> Option<&str> {
        self.merged.source_name.as_ref().map(|s| s.value.as_str())
    }

    pub fn elapsed_ms(&self) -> Option<u64> {
        self.merged.elapsed_ms
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.merged.updated_at
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn is_settled(&self) -> bool {
        self.phase == SyncPhase::Settled
    }

    pub fn is_lost(&self) -> bool {
        self.lost
    }

    pub fn logs(&self) -> &LogRing {
        &self.logs
    }

    /// Whether two views agree on everything merged from the server.
    pub fn same_state(&self, other: &JobView) -> bool {
        self.job_id == other.job_id && self.merged == other.merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn update(secs: i64, stage: Stage, percent: u8) -> StateUpdate {
        StateUpdate {
            job_id: "j1".into(),
            ts: at(secs),
            stage: Some(stage),
            percent: Some(percent),
            ok: None,
            error: None,
            result_path: None,
            source_name: None,
            elapsed_ms: None,
        }
    }

    fn done(secs: i64) -> StateUpdate {
        StateUpdate {
            ok: Some(true),
            result_path: Some("/out/j1/a.md".into()),
            ..update(secs, Stage::Done, 100)
        }
    }

    #[test]
    fn test_stale_update_does_not_regress() {
        let mut view = JobView::new("j1");
        assert!(view.apply(&update(2, Stage::Convert, 40)));
        assert!(!view.apply(&update(1, Stage::Prepare, 1)));
        assert_eq!(view.stage(), Stage::Convert);
        assert_eq!(view.percent(), 40);
        assert_eq!(view.updated_at(), Some(at(2)));
    }

    #[test]
    fn test_missing_fields_never_clear() {
        let mut view = JobView::new("j1");
        view.apply(&StateUpdate {
            source_name: Some("a.pdf".into()),
            ..update(1, Stage::Queued, 0)
        });
        view.apply(&StateUpdate {
            stage: None,
            percent: None,
            ..update(2, Stage::Queued, 0)
        });
        assert_eq!(view.source_name(), Some("a.pdf"));
        assert_eq!(view.stage(), Stage::Queued);
    }

    #[test]
    fn test_ok_is_never_overwritten() {
        let mut view = JobView::new("j1");
        view.apply(&done(5));
        view.apply(&StateUpdate {
            ok: Some(false),
            error: Some("late".into()),
            ..update(9, Stage::Error, 100)
        });
        assert_eq!(view.ok(), Some(true));
        assert_eq!(view.stage(), Stage::Done);
        assert_eq!(view.result_path(), Some("/out/j1/a.md"));
    }

    #[test]
    fn test_stale_running_update_after_terminal_keeps_terminal() {
        let mut view = JobView::new("j1");
        view.apply(&done(5));
        assert!(!view.apply(&update(3, Stage::Convert, 50)));
        assert_eq!(view.stage(), Stage::Done);
        assert_eq!(view.percent(), 100);
    }

    #[test]
    fn test_failure_pins_error_stage() {
        let mut view = JobView::new("j1");
        view.apply(&update(1, Stage::Convert, 30));
        view.apply(&StateUpdate {
            ok: Some(false),
            error: Some("Failed to convert. Check logs for detailed traceback.".into()),
            stage: None,
            percent: None,
            ..update(2, Stage::Convert, 0)
        });
        assert_eq!(view.stage(), Stage::Error);
        assert_eq!(view.percent(), 100);
        assert!(view.error().unwrap().starts_with("Failed to convert."));
    }

    #[test]
    fn test_updates_for_other_jobs_are_ignored() {
        let mut view = JobView::new("j1");
        let foreign = StateUpdate {
            job_id: "j2".into(),
            ..done(1)
        };
        assert!(!view.apply(&foreign));
        assert_eq!(view.ok(), None);
    }

    #[test]
    fn test_settled_phase_is_final() {
        let mut view = JobView::new("j1");
        assert!(view.set_phase(SyncPhase::Streaming));
        assert!(view.set_phase(SyncPhase::Settled));
        assert!(!view.set_phase(SyncPhase::Polling));
        assert_eq!(view.phase(), SyncPhase::Settled);
    }

    #[test]
    fn test_mark_lost_only_while_unknown() {
        let mut view = JobView::new("j1");
        assert!(view.mark_lost());
        assert!(view.is_lost());
        assert!(view.is_settled());

        let mut finished = JobView::new("j1");
        finished.apply(&done(1));
        assert!(!finished.mark_lost());
        assert!(!finished.is_lost());
    }

    #[test]
    fn test_log_ring_keeps_latest() {
        let mut ring = LogRing::new(3);
        for i in 0..5 {
            ring.push(LogEntry {
                ts: at(i),
                level: LogLevel::Info,
                stage: None,
                message: format!("line {i}"),
            });
        }
        let messages: Vec<_> = ring.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["line 2", "line 3", "line 4"]);
        assert_eq!(ring.dropped(), 2);
    }

    #[test]
    fn test_log_events_fill_ring_not_state() {
        let mut view = JobView::with_log_capacity("j1", 2);
        let log = JobEvent::Log(LogLine {
            job_id: "j1".into(),
            ts: at(1),
            level: LogLevel::Warn,
            stage: Stage::Convert,
            message: "slow page".into(),
            percent: Some(70),
            elapsed_ms: None,
        });
        assert!(view.apply_event(&log));
        assert_eq!(view.percent(), 0);
        assert_eq!(view.logs().last().unwrap().message, "slow page");
    }

    /// The updates one job emits over its life, as a server would.
    fn job_history(fail: bool) -> Vec<StateUpdate> {
        let mut updates = vec![
            StateUpdate {
                source_name: Some("a.pdf".into()),
                ..update(0, Stage::Queued, 0)
            },
            update(1, Stage::Prepare, 1),
            update(2, Stage::Convert, 5),
            update(3, Stage::Convert, 33),
            update(4, Stage::Convert, 71),
            update(5, Stage::CollectOutput, 90),
        ];
        if fail {
            updates.push(StateUpdate {
                ok: Some(false),
                error: Some("Failed to convert. Detected Layout engine issue.".into()),
                ..update(6, Stage::Error, 100)
            });
        } else {
            updates.push(done(6));
        }
        updates
    }

    proptest! {
        #[test]
        fn prop_merge_is_order_independent(
            fail in any::<bool>(),
            picks in proptest::collection::vec(0usize..7, 1..30),
        ) {
            let history = job_history(fail);
            let shuffled: Vec<&StateUpdate> = picks.iter().map(|&i| &history[i]).collect();

            let mut forward = JobView::new("j1");
            for u in &shuffled {
                forward.apply(u);
            }
            let mut backward = JobView::new("j1");
            for u in shuffled.iter().rev() {
                backward.apply(u);
            }
            // Re-applying everything changes nothing.
            let mut again = forward.clone();
            for u in &shuffled {
                prop_assert!(!again.apply(u));
            }

            prop_assert!(forward.same_state(&backward));
            prop_assert!(forward.same_state(&again));
        }

        #[test]
        fn prop_percent_never_decreases(
            picks in proptest::collection::vec(0usize..7, 1..30),
        ) {
            let history = job_history(false);
            let mut view = JobView::new("j1");
            let mut last = 0u8;
            for i in picks {
                view.apply(&history[i]);
                prop_assert!(view.percent() >= last);
                last = view.percent();
            }
        }
    }
}

// crates/core/src/record.rs
//! The mutable job record and the invariants guarding it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TransitionError;
use crate::event::StateUpdate;
use crate::stage::Stage;

/// Opaque job identifier, assigned at submission.
pub type JobId = String;

/// Highest percent a job may report before it reaches a terminal outcome.
pub const MAX_RUNNING_PERCENT: u8 = 99;

/// Generate a new job id: `YYYYmmdd_HHMMSS_<8 hex>`.
///
/// The timestamp prefix keeps output directories sortable; the random
/// suffix keeps two submissions in the same second apart.
pub fn new_job_id(now: DateTime<Utc>) -> JobId {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", now.format("%Y%m%d_%H%M%S"), &suffix[..8])
}

/// Live state of one job.
///
/// Mutated only through [`advance`](JobRecord::advance),
/// [`succeed`](JobRecord::succeed) and [`fail`](JobRecord::fail), which
/// reject any change that would violate:
/// - `percent` never decreases,
/// - `ok` moves from unknown to a value exactly once,
/// - `stage` only moves forward (or jumps to `error`),
/// - `result_path` is set iff `ok == Some(true)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub stage: Stage,
    pub percent: u8,
    /// `None` while the job is running.
    pub ok: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
    pub source_name: String,
    #[serde(default)]
    pub result_path: Option<String>,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// A freshly submitted job: `queued`, 0%, outcome unknown.
    pub fn new(job_id: impl Into<JobId>, source_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.into(),
            stage: Stage::Queued,
            percent: 0,
            ok: None,
            error: None,
            source_name: source_name.into(),
            result_path: None,
            backend: None,
            mode: None,
            user: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_backend(mut self, backend: Option<String>) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_mode(mut self, mode: Option<String>) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// True once `ok` has been decided.
    pub fn is_terminal(&self) -> bool {
        self.ok.is_some()
    }

    /// Move to `stage` (or stay in it) and raise `percent`.
    ///
    /// A lower percent than the current one is ignored rather than
    /// rejected, so callers can report coarse progress without tracking it.
    pub fn advance(
        &mut self,
        stage: Stage,
        percent: u8,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.ensure_running()?;
        if stage.is_terminal() {
            return Err(TransitionError::TerminalStage { stage });
        }
        if !self.stage.can_transition_to(stage) {
            return Err(TransitionError::Backward {
                job_id: self.job_id.clone(),
                from: self.stage,
                to: stage,
            });
        }
        self.stage = stage;
        self.percent = self.percent.max(percent.min(MAX_RUNNING_PERCENT));
        self.touch(now);
        Ok(())
    }

    /// Terminal success: `done`, 100%, `ok = true`, result path recorded.
    pub fn succeed(
        &mut self,
        result_path: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.ensure_running()?;
        self.stage = Stage::Done;
        self.percent = 100;
        self.ok = Some(true);
        self.error = None;
        self.result_path = Some(result_path.into());
        self.touch(now);
        Ok(())
    }

    /// Terminal failure: `error`, `ok = false`, message kept verbatim.
    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_running()?;
        self.stage = Stage::Error;
        self.percent = 100;
        self.ok = Some(false);
        self.error = Some(error.into());
        self.result_path = None;
        self.touch(now);
        Ok(())
    }

    /// Full copy of the state-bearing fields as an event payload.
    pub fn to_update(&self) -> StateUpdate {
        StateUpdate {
            job_id: self.job_id.clone(),
            ts: self.updated_at,
            stage: Some(self.stage),
            percent: Some(self.percent),
            ok: self.ok,
            error: self.error.clone(),
            result_path: self.result_path.clone(),
            source_name: Some(self.source_name.clone()),
            elapsed_ms: None,
        }
    }

    fn ensure_running(&self) -> Result<(), TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::AlreadyFinished {
                job_id: self.job_id.clone(),
            });
        }
        Ok(())
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = self.updated_at.max(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_new_record_is_queued_and_unknown() {
        let rec = JobRecord::new("j1", "report.pdf", t(0));
        assert_eq!(rec.stage, Stage::Queued);
        assert_eq!(rec.percent, 0);
        assert_eq!(rec.ok, None);
        assert!(rec.result_path.is_none());
        assert!(!rec.is_terminal());
    }

    #[test]
    fn test_job_id_format() {
        let id = new_job_id(t(0));
        assert_eq!(id.len(), "20231114_221320_".len() + 8);
        assert_eq!(&id[8..9], "_");
        assert!(id[16..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(new_job_id(t(0)), new_job_id(t(0)));
    }

    #[test]
    fn test_full_success_lifecycle() {
        let mut rec = JobRecord::new("j1", "report.pdf", t(0));
        rec.advance(Stage::Prepare, 1, t(1)).unwrap();
        rec.advance(Stage::Convert, 5, t(2)).unwrap();
        rec.advance(Stage::Convert, 40, t(3)).unwrap();
        rec.advance(Stage::CollectOutput, 90, t(4)).unwrap();
        rec.succeed("/out/j1/report.md", t(5)).unwrap();

        assert_eq!(rec.stage, Stage::Done);
        assert_eq!(rec.percent, 100);
        assert_eq!(rec.ok, Some(true));
        assert_eq!(rec.result_path.as_deref(), Some("/out/j1/report.md"));
        assert_eq!(rec.updated_at, t(5));
    }

    #[test]
    fn test_percent_never_decreases() {
        let mut rec = JobRecord::new("j1", "a.pdf", t(0));
        rec.advance(Stage::Convert, 50, t(1)).unwrap();
        rec.advance(Stage::Convert, 20, t(2)).unwrap();
        assert_eq!(rec.percent, 50);
    }

    #[test]
    fn test_running_percent_capped_below_100() {
        let mut rec = JobRecord::new("j1", "a.pdf", t(0));
        rec.advance(Stage::Convert, 100, t(1)).unwrap();
        assert_eq!(rec.percent, MAX_RUNNING_PERCENT);
    }

    #[test]
    fn test_backward_stage_rejected() {
        let mut rec = JobRecord::new("j1", "a.pdf", t(0));
        rec.advance(Stage::Convert, 5, t(1)).unwrap();
        let err = rec.advance(Stage::Prepare, 10, t(2)).unwrap_err();
        assert!(matches!(err, TransitionError::Backward { .. }));
        assert_eq!(rec.stage, Stage::Convert);
    }

    #[test]
    fn test_terminal_stage_via_advance_rejected() {
        let mut rec = JobRecord::new("j1", "a.pdf", t(0));
        let err = rec.advance(Stage::Done, 100, t(1)).unwrap_err();
        assert_eq!(err, TransitionError::TerminalStage { stage: Stage::Done });
    }

    #[test]
    fn test_outcome_set_exactly_once() {
        let mut rec = JobRecord::new("j1", "a.pdf", t(0));
        rec.fail("engine exploded", t(1)).unwrap();
        assert_eq!(rec.ok, Some(false));
        assert_eq!(rec.error.as_deref(), Some("engine exploded"));
        assert!(rec.result_path.is_none());

        assert!(rec.succeed("/x.md", t(2)).is_err());
        assert!(rec.fail("again", t(2)).is_err());
        assert!(rec.advance(Stage::Convert, 10, t(2)).is_err());
        assert_eq!(rec.stage, Stage::Error);
        assert_eq!(rec.error.as_deref(), Some("engine exploded"));
    }

    #[test]
    fn test_updated_at_non_decreasing() {
        let mut rec = JobRecord::new("j1", "a.pdf", t(10));
        rec.advance(Stage::Prepare, 1, t(10) - Duration::seconds(5)).unwrap();
        assert_eq!(rec.updated_at, t(10));
    }

    #[test]
    fn test_to_update_carries_full_state() {
        let mut rec = JobRecord::new("j1", "a.pdf", t(0));
        rec.advance(Stage::Convert, 30, t(1)).unwrap();
        let update = rec.to_update();
        assert_eq!(update.stage, Some(Stage::Convert));
        assert_eq!(update.percent, Some(30));
        assert_eq!(update.ok, None);
        assert_eq!(update.source_name.as_deref(), Some("a.pdf"));
        assert_eq!(update.ts, t(1));
    }

    #[test]
    fn test_record_json_keeps_unknown_ok_as_null() {
        let rec = JobRecord::new("j1", "a.pdf", t(0));
        let json = serde_json::to_value(&rec).unwrap();
        assert!(json["ok"].is_null());
        assert_eq!(json["stage"], "queued");
        let back: JobRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, rec);
    }
}

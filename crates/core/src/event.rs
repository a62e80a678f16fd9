// crates/core/src/event.rs
//! Events published for a job.
//!
//! On the wire every event is a flat JSON object tagged by `type`:
//!
//! ```json
//! {"type":"progress","job_id":"...","ts":"...","stage":"convert","percent":42,"ok":null}
//! {"type":"log","job_id":"...","ts":"...","level":"INFO","stage":"convert","message":"..."}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::JobId;
use crate::stage::Stage;

/// Severity of a relayed log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A partial or full copy of the job record at one instant.
///
/// Missing fields mean "not observed", never "cleared".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    pub job_id: JobId,
    pub ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,
    #[serde(default)]
    pub ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
}

/// A diagnostic line relayed from the worker or the conversion engine.
/// Informational only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub job_id: JobId,
    pub ts: DateTime<Utc>,
    pub level: LogLevel,
    pub stage: Stage,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
}

/// One immutable observation about a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// Full state, sent first to every new subscriber.
    Snapshot(StateUpdate),
    /// State change pushed by the stage worker.
    Progress(StateUpdate),
    Log(LogLine),
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Snapshot(u) | JobEvent::Progress(u) => &u.job_id,
            JobEvent::Log(l) => &l.job_id,
        }
    }

    pub fn ts(&self) -> DateTime<Utc> {
        match self {
            JobEvent::Snapshot(u) | JobEvent::Progress(u) => u.ts,
            JobEvent::Log(l) => l.ts,
        }
    }

    /// The state payload, if this event carries one.
    pub fn state(&self) -> Option<&StateUpdate> {
        match self {
            JobEvent::Snapshot(u) | JobEvent::Progress(u) => Some(u),
            JobEvent::Log(_) => None,
        }
    }

    /// A state-bearing event with a decided outcome.
    pub fn is_terminal(&self) -> bool {
        self.state().is_some_and(|u| u.ok.is_some())
    }

    pub fn is_log(&self) -> bool {
        matches!(self, JobEvent::Log(_))
    }
}

// crates/core/src/error.rs
use std::path::PathBuf;
use thiserror::Error;

use crate::stage::Stage;

/// A mutation that would break one of the job record invariants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("job {job_id} already finished; record is immutable")]
    AlreadyFinished { job_id: String },

    #[error("job {job_id} cannot move from {from} to {to}")]
    Backward { job_id: String, from: Stage, to: Stage },

    #[error("stage {stage} is terminal; use succeed() or fail()")]
    TerminalStage { stage: Stage },
}

/// Errors produced while decoding a framed event block.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("frame has no data field")]
    MissingData,

    #[error("frame exceeds {limit} bytes")]
    Oversized { limit: usize },

    #[error("malformed event payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by the durable event log.
#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("IO error on event log {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode event log record: {0}")]
    Encode(#[from] serde_json::Error),
}

impl EventLogError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

// crates/core/src/stage.rs
//! Pipeline stages of a conversion job.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A named phase of a job's pipeline.
///
/// Forward order is `queued → prepare → convert → collect_output → done`.
/// `error` can be entered from any non-terminal stage. `done` and `error`
/// are terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Queued,
    Prepare,
    Convert,
    CollectOutput,
    Done,
    Error,
}

impl Stage {
    /// The success path, in order.
    pub const PIPELINE: [Stage; 5] = [
        Stage::Queued,
        Stage::Prepare,
        Stage::Convert,
        Stage::CollectOutput,
        Stage::Done,
    ];

    /// Position used for ordering. `Error` ranks above `Done` so that a
    /// max-by-rank fold always lands on a terminal stage.
    pub fn rank(self) -> u8 {
        match self {
            Stage::Queued => 0,
            Stage::Prepare => 1,
            Stage::Convert => 2,
            Stage::CollectOutput => 3,
            Stage::Done => 4,
            Stage::Error => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::Error)
    }

    /// Whether a record sitting in `self` may be moved to `next`.
    ///
    /// Staying in the same stage is allowed (progress inside a stage).
    pub fn can_transition_to(self, next: Stage) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == Stage::Error || next.rank() >= self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Queued => "queued",
            Stage::Prepare => "prepare",
            Stage::Convert => "convert",
            Stage::CollectOutput => "collect_output",
            Stage::Done => "done",
            Stage::Error => "error",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

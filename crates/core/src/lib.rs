// crates/core/src/lib.rs
//! Shared domain model for docjobs.
//!
//! The job record and its stage machine, the event wire format, and the
//! durable event log plus the history view derived from it. Server and
//! client both depend on this crate so they agree on one vocabulary.

pub mod error;
pub mod event;
pub mod event_log;
pub mod frame;
pub mod history;
pub mod record;
pub mod stage;

pub use error::*;
pub use event::*;
pub use event_log::{EventLog, HistoryRecord, JsonlEventLog, MemoryEventLog};
pub use history::{aggregate, HistoryQuery, HistoryRow};
pub use record::*;
pub use stage::Stage;

// crates/server/src/jobs/mod.rs
//! Job lifecycle: record store, event bus, stage worker and retention.
//!
//! Provides:
//! - `JobStore` — live records keyed by job id
//! - `EventBus` — per-job fan-out with replay for late subscribers
//! - `JobRunner` — accepts submissions and spawns stage workers
//! - `Sweeper` — evicts expired jobs and their directories

pub mod bus;
pub mod runner;
pub mod store;
pub mod sweeper;

pub use bus::{EventBus, Subscription};
pub use runner::{JobRunner, Submission};
pub use store::{JobSlot, JobStore};
pub use sweeper::{SweepReport, Sweeper};

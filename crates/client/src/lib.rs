// crates/client/src/lib.rs
//! docjobs client library.
//!
//! Tracks a conversion job from the outside: follows its event stream,
//! falls back to polling snapshots when the stream is unavailable, merges
//! both into one [`JobView`], and fetches the result exactly once when the
//! job succeeds.

pub mod api;
pub mod error;
pub mod persist;
pub mod tracker;
pub mod view;

pub use api::{EventStream, HttpJobApi, JobApi, StreamItem, Submitted, Upload};
pub use error::{ClientError, ClientResult};
pub use persist::{FileTrackedJobStore, MemoryTrackedJobStore, TrackedJobStore};
pub use tracker::{FetchState, JobTracker, SyncConfig};
pub use view::{JobView, LogEntry, LogRing, SyncPhase};

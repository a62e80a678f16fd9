// crates/server/src/state.rs
//! Application state for the Axum server.

use std::sync::Arc;
use std::time::Instant;

use docjobs_core::EventLog;

use crate::config::Settings;
use crate::engine::ConversionEngine;
use crate::jobs::{EventBus, JobRunner, JobStore, Sweeper};

/// Shared application state accessible from all route handlers.
pub struct AppState {
    /// Server start time for uptime tracking.
    pub start_time: Instant,
    pub settings: Arc<Settings>,
    /// Live job records.
    pub store: Arc<JobStore>,
    /// Per-job event fan-out.
    pub bus: Arc<EventBus>,
    pub runner: Arc<JobRunner>,
    /// Durable start/outcome log that history is rebuilt from.
    pub history: Arc<dyn EventLog>,
}

impl AppState {
    /// Wire up store, bus and runner around the given engine and log.
    pub fn new(
        settings: Settings,
        engine: Arc<dyn ConversionEngine>,
        history: Arc<dyn EventLog>,
    ) -> Arc<Self> {
        let store = Arc::new(JobStore::new());
        let bus = Arc::new(EventBus::new(Arc::clone(&store)));
        let runner = Arc::new(JobRunner::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            engine,
            Arc::clone(&history),
            settings.progress_step,
        ));
        Arc::new(Self {
            start_time: Instant::now(),
            settings: Arc::new(settings),
            store,
            bus,
            runner,
            history,
        })
    }

    /// Get the server uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Retention sweeper bound to this state's store, bus and settings.
    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(
            Arc::clone(&self.store),
            Arc::clone(&self.bus),
            self.settings.output_root.clone(),
            self.settings.job_ttl(),
        )
    }
}

// crates/server/src/routes/status.rs
//! Engine and capacity status.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::engine::ConvertMode;
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct StatusResponse {
    pub engine: String,
    /// False when the engine executable cannot be found.
    pub engine_available: bool,
    pub modes: Vec<String>,
    pub output_root: String,
    pub active_jobs: usize,
    pub uptime_secs: u64,
}

/// GET /api/status
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let engine = state.runner.engine();
    Json(StatusResponse {
        engine: engine.name().to_string(),
        engine_available: engine.is_available(),
        modes: ConvertMode::ALL.iter().map(|m| m.as_str().to_string()).collect(),
        output_root: state.settings.output_root.display().to_string(),
        active_jobs: state.store.active().len(),
        uptime_secs: state.uptime_secs(),
    })
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/status", get(get_status))
}

// crates/server/src/routes/health.rs
//! Liveness and readiness of the conversion service.
//!
//! `GET /api/health` answers 200 with `status: "ok"` when jobs can be
//! accepted and finished: the engine is runnable, the output root is a
//! writable directory and the history log can be appended to. Otherwise it
//! answers 503 with `status: "degraded"` and the failing checks.

use std::path::Path;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub engine: String,
    pub engine_available: bool,
    pub output_root_writable: bool,
    pub history_writable: bool,
    /// Records held in memory, finished or not.
    pub tracked_jobs: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub problems: Vec<String>,
}

async fn dir_writable(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.is_dir() && !meta.permissions().readonly(),
        Err(_) => false,
    }
}

/// GET /api/health
pub async fn health_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<HealthResponse>) {
    let engine = state.runner.engine();
    let engine_available = engine.is_available();
    let output_root = &state.settings.output_root;
    let output_root_writable = dir_writable(output_root).await;

    let mut problems = Vec::new();
    if !engine_available {
        problems.push(format!("engine '{}' is not runnable", engine.name()));
    }
    if !output_root_writable {
        problems.push(format!(
            "output root {} is not a writable directory",
            output_root.display()
        ));
    }
    let history_writable = match state.history.check_writable().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "history log not writable");
            problems.push(e.to_string());
            false
        }
    };

    let status = if problems.is_empty() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = HealthResponse {
        status: if problems.is_empty() { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.uptime_secs(),
        engine: engine.name().to_string(),
        engine_available,
        output_root_writable,
        history_writable,
        tracked_jobs: state.store.len(),
        problems,
    };
    (status, Json(body))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health_check))
}

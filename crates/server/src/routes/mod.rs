//! API route handlers for the docjobs server.

pub mod health;
pub mod history;
pub mod jobs;
pub mod metrics;
pub mod status;

use std::sync::Arc;

use axum::Router;

use crate::state::AppState;

/// Create the combined router: API routes under `/api`, metrics at the root.
///
/// Routes:
/// - GET  /api/health - Health check
/// - POST /api/convert - Upload a PDF and start a conversion job
/// - GET  /api/jobs - Live jobs
/// - GET  /api/jobs/{id} - Snapshot of one job
/// - GET  /api/jobs/{id}/events - SSE stream of job events
/// - GET  /api/jobs/{id}/result - Converted Markdown
/// - GET  /api/history - Successful conversions, newest first
/// - GET  /api/history/raw - Raw event log records
/// - GET  /api/status - Engine availability and active jobs
/// - GET  /metrics - Prometheus metrics
pub fn api_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api", health::router())
        .nest("/api", jobs::router())
        .nest("/api", history::router())
        .nest("/api", status::router())
        .merge(metrics::router())
        .with_state(state)
}

// crates/server/src/routes/history.rs
//! Conversion history rebuilt from the durable event log.
//!
//! - GET /history?limit=&q=   — one row per successful job, newest first
//! - GET /history/raw?limit=  — the newest raw log records

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use docjobs_core::{aggregate, HistoryQuery, HistoryRecord, HistoryRow};
use serde::{Deserialize, Serialize};

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct HistoryResponse {
    pub items: Vec<HistoryRow>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct RawHistoryResponse {
    pub items: Vec<HistoryRecord>,
}

/// GET /api/history
async fn history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<HistoryResponse>> {
    let records = state.history.read_all().await?;
    let items = aggregate(&records, &query);
    tracing::debug!(records = records.len(), rows = items.len(), "history aggregated");
    Ok(Json(HistoryResponse { items }))
}

/// GET /api/history/raw
async fn raw_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RawQuery>,
) -> ApiResult<Json<RawHistoryResponse>> {
    let limit = HistoryQuery {
        limit: query.limit,
        q: None,
    }
    .effective_limit();
    let items = state.history.read_recent(limit).await?;
    Ok(Json(RawHistoryResponse { items }))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/history", get(history))
        .route("/history/raw", get(raw_history))
}

// crates/server/src/lib.rs
//! docjobs server library.
//!
//! Axum server that accepts PDF uploads, runs each conversion as a staged
//! background job, and streams the job's progress to any number of
//! subscribers over SSE. Finished jobs are recorded in a durable event log
//! that the history endpoint aggregates.

pub mod config;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod routes;
pub mod state;

pub use config::{EngineKind, Settings};
pub use error::*;
pub use routes::api_routes;
pub use state::AppState;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::HeaderValue;
use axum::Router;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::engine::{ConversionEngine, MineruEngine, ScriptedEngine};

/// Create the Axum application with all routes and middleware.
///
/// This sets up:
/// - API routes plus `/metrics`
/// - CORS (any origin unless `cors_origins` lists some)
/// - The upload body limit
/// - Request tracing
pub fn create_app(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.settings.cors_origins);
    let body_limit = DefaultBodyLimit::max(state.settings.max_upload_bytes());

    Router::new()
        .merge(api_routes(state))
        .layer(body_limit)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .map(|o| o.trim())
        .filter(|o| !o.is_empty())
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    let origin = if allowed.is_empty() {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(allowed)
    };
    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// The conversion engine selected by `settings.engine`.
pub fn build_engine(settings: &Settings) -> Arc<dyn ConversionEngine> {
    match settings.engine {
        EngineKind::Mineru => Arc::new(MineruEngine::new(settings.engine_cli.clone())),
        EngineKind::Scripted => Arc::new(ScriptedEngine::succeeding()),
    }
}


// ============================================================================
// Integration Tests
// ============================================================================

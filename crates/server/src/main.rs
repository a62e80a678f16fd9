// crates/server/src/main.rs
//! docjobs server binary.
//!
//! Loads `.env`, parses settings, opens the event log and serves the API
//! until Ctrl-C. The retention sweeper runs alongside and stops with it.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use docjobs_core::JsonlEventLog;
use docjobs_server::{build_engine, create_app, metrics::init_metrics, AppState, Settings};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "warn,docjobs_server=info,docjobs_core=info".into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl-C");
    }
    tracing::info!("shutting down");
    cancel.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let settings = Settings::parse();
    init_tracing(settings.log_json);
    init_metrics();

    tokio::fs::create_dir_all(&settings.output_root)
        .await
        .with_context(|| format!("creating output root {}", settings.output_root.display()))?;

    let engine = build_engine(&settings);
    if !engine.is_available() {
        tracing::warn!(
            engine = engine.name(),
            cli = %settings.engine_cli,
            "conversion engine not found; jobs will fail until it is installed"
        );
    }

    let history = Arc::new(JsonlEventLog::new(settings.history_path()));
    let addr = settings.bind_addr();
    let state = AppState::new(settings, engine, history);

    let cancel = CancellationToken::new();
    let sweeper = state.sweeper().spawn(cancel.clone());

    let app = create_app(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(
        addr = %addr,
        engine = state.runner.engine().name(),
        output_root = %state.settings.output_root.display(),
        "docjobs listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    cancel.cancel();
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "sweeper task ended abnormally");
    }
    Ok(())
}

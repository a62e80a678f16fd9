//! Application metrics for Prometheus monitoring.
//!
//! This module provides:
//! - Prometheus metrics recorder initialization
//! - Metric definitions (counters, histograms, gauges)
//! - Helper functions for recording job and stream metrics

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Call once at startup, before any metrics are recorded. Returns `true` if
/// initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        return false;
    }

    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    if metrics::set_global_recorder(recorder).is_err() {
        tracing::warn!("Failed to set global metrics recorder (already set)");
        return false;
    }

    if PROMETHEUS_HANDLE.set(handle).is_err() {
        tracing::warn!("Failed to store Prometheus handle (already set)");
    }

    describe_metrics();

    tracing::info!("Prometheus metrics initialized");
    true
}

fn describe_metrics() {
    describe_counter!(
        "docjobs_jobs_submitted_total",
        "Total number of conversion jobs accepted"
    );
    describe_counter!(
        "docjobs_jobs_finished_total",
        "Total number of jobs that reached a terminal outcome"
    );
    describe_histogram!(
        "docjobs_job_duration_seconds",
        "Wall time from submission to terminal outcome in seconds"
    );
    describe_gauge!(
        "docjobs_stream_subscribers",
        "Number of open job event subscriptions"
    );
}

/// Render current metrics in Prometheus text format.
///
/// Returns `None` if metrics are not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|h| h.render())
}

pub fn record_submitted() {
    counter!("docjobs_jobs_submitted_total").increment(1);
}

/// Record a terminal outcome (`"ok"`, `"failed"` or `"panicked"`).
pub fn record_finished(outcome: &'static str, duration: Duration) {
    counter!("docjobs_jobs_finished_total", "outcome" => outcome).increment(1);
    histogram!("docjobs_job_duration_seconds", "outcome" => outcome)
        .record(duration.as_secs_f64());
}

/// Keeps `docjobs_stream_subscribers` in step with live subscriptions.
///
/// Increments on creation and decrements on drop.
pub struct SubscriberGauge(());

impl SubscriberGauge {
    pub fn acquire() -> Self {
        gauge!("docjobs_stream_subscribers").increment(1.0);
        Self(())
    }
}

impl Drop for SubscriberGauge {
    fn drop(&mut self) {
        gauge!("docjobs_stream_subscribers").decrement(1.0);
    }
}

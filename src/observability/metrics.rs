//! Lifecycle metrics.
//!
//! # Metrics
//! - `graceful_connections_total` (counter): connections accepted
//! - `graceful_connections_active` (gauge): connections currently open
//! - `graceful_shutdown_duration_seconds` (histogram): time spent in shutdown, by outcome
//! - `graceful_hook_runs_total` (counter): hook executions, by phase and outcome
//! - `graceful_serve_errors_total` (counter): serve loops that ended with an error
//!
//! Recording is a no-op until a recorder is installed, so library users who
//! never call [`init_metrics`] pay only for the macro dispatch.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::lifecycle::hooks::Phase;

/// Install the Prometheus recorder and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_connection_opened() {
    counter!("graceful_connections_total").increment(1);
    gauge!("graceful_connections_active").increment(1.0);
}

pub fn record_connection_closed() {
    gauge!("graceful_connections_active").decrement(1.0);
}

pub fn record_shutdown(started: Instant, success: bool) {
    let outcome = if success { "ok" } else { "error" };
    histogram!("graceful_shutdown_duration_seconds", "outcome" => outcome)
        .record(started.elapsed().as_secs_f64());
}

pub fn record_hook(phase: Phase, success: bool) {
    let outcome = if success { "ok" } else { "error" };
    counter!("graceful_hook_runs_total", "phase" => phase.as_str(), "outcome" => outcome)
        .increment(1);
}

pub fn record_serve_error() {
    counter!("graceful_serve_errors_total").increment(1);
}

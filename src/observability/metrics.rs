//! Metrics collection and exposition.
//!
//! # Metrics
//! - `relay_sessions_total` (counter): sessions accepted
//! - `relay_sessions_active` (gauge): sessions currently registered
//! - `relay_session_failures_total` (counter): failed sessions by kind
//! - `relay_bytes_total` (counter): bytes forwarded by direction
//! - `relay_chunks_total` (counter): chunks forwarded by direction
//! - `relay_stage_failures_total` (counter): failed or panicked stages by name
//! - `relay_log_write_failures_total` (counter): session log writes that failed
//!
//! Without an installed recorder every call below is a no-op.

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::transform::Direction;

/// Install the Prometheus recorder and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, "Failed to install metrics exporter: {}", e),
    }
}

pub fn record_session_opened() {
    counter!("relay_sessions_total").increment(1);
}

pub fn record_active_sessions(count: usize) {
    gauge!("relay_sessions_active").set(count as f64);
}

pub fn record_session_failure(kind: &'static str) {
    counter!("relay_session_failures_total", "kind" => kind).increment(1);
}

pub fn record_chunk(direction: Direction, bytes: usize) {
    counter!("relay_chunks_total", "direction" => direction.as_str()).increment(1);
    counter!("relay_bytes_total", "direction" => direction.as_str()).increment(bytes as u64);
}

pub fn record_stage_failure(stage: &str) {
    counter!("relay_stage_failures_total", "stage" => stage.to_string()).increment(1);
}

pub fn record_log_write_failure() {
    counter!("relay_log_write_failures_total").increment(1);
}

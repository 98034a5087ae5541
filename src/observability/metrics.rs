//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define proxy metrics (requests, latency, admission, backend lifecycle)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `proxy_requests_total` (counter): requests by method, status, zone
//! - `proxy_request_duration_seconds` (histogram): latency distribution
//! - `proxy_rate_limited_total` (counter): 429s by zone
//! - `proxy_rate_limit_keys` (gauge): tracked client keys by zone
//! - `proxy_rejected_requests_total` (counter): limit rejections by status
//! - `proxy_backend_state` (gauge): one series per state, 1 for the current one
//! - `proxy_backend_restarts_total` (counter)
//! - `proxy_health_probes_total` (counter): probes by result
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed, so tests need no setup
//! - Zone label is bounded by configuration, never by client input

use std::net::SocketAddr;
use std::time::Instant;

use axum::http::StatusCode;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::supervisor::BackendState;

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install Prometheus recorder"),
    }
}

pub fn record_request(method: &str, status: u16, zone: Option<&str>, start: Instant) {
    let zone = zone.unwrap_or("none").to_string();
    counter!(
        "proxy_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string(),
        "zone" => zone.clone()
    )
    .increment(1);
    histogram!("proxy_request_duration_seconds", "zone" => zone).record(start.elapsed().as_secs_f64());
}

pub fn record_rate_limited(zone: &str) {
    counter!("proxy_rate_limited_total", "zone" => zone.to_string()).increment(1);
}

pub fn record_rate_limit_keys(zone: &str, keys: usize) {
    gauge!("proxy_rate_limit_keys", "zone" => zone.to_string()).set(keys as f64);
}

pub fn record_rejection(status: StatusCode) {
    counter!("proxy_rejected_requests_total", "status" => status.as_u16().to_string()).increment(1);
}

pub fn record_backend_state(state: BackendState) {
    for candidate in BackendState::ALL {
        let value = if candidate == state { 1.0 } else { 0.0 };
        gauge!("proxy_backend_state", "state" => candidate.as_str()).set(value);
    }
}

pub fn record_backend_restart() {
    counter!("proxy_backend_restarts_total").increment(1);
}

pub fn record_probe(success: bool) {
    let result = if success { "ok" } else { "fail" };
    counter!("proxy_health_probes_total", "result" => result).increment(1);
}

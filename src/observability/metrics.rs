//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define gateway metrics (requests, bytes moved, commits, hits)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `gateway_requests_total` (counter): requests by target, outcome, status
//! - `gateway_request_duration_seconds` (histogram): latency by target
//! - `gateway_store_bytes_total` (counter): bytes written to storage
//! - `gateway_store_commits_total` (counter): fail-safe commits
//! - `gateway_retrieve_bytes_total` (counter): bytes served, by kind
//! - `gateway_query_hits_total` (counter): hits returned
//! - `gateway_acceptor_rebuilds_total` (counter): wait set rebuilds
//! - `gateway_active_connections` (gauge): connections being served
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder with an HTTP scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(target: &'static str, outcome: &'static str, status: u16, start: Instant) {
    ::metrics::counter!(
        "gateway_requests_total",
        "target" => target,
        "outcome" => outcome,
        "status" => status.to_string()
    )
    .increment(1);
    ::metrics::histogram!("gateway_request_duration_seconds", "target" => target)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_store_bytes(bytes: u64) {
    ::metrics::counter!("gateway_store_bytes_total").increment(bytes);
}

pub fn record_store_commit() {
    ::metrics::counter!("gateway_store_commits_total").increment(1);
}

pub fn record_retrieve_bytes(kind: &'static str, bytes: u64) {
    ::metrics::counter!("gateway_retrieve_bytes_total", "kind" => kind).increment(bytes);
}

pub fn record_query_hits(hits: u64) {
    ::metrics::counter!("gateway_query_hits_total").increment(hits);
}

pub fn record_acceptor_rebuild() {
    ::metrics::counter!("gateway_acceptor_rebuilds_total").increment(1);
}

pub fn record_active_connections(count: u64) {
    ::metrics::gauge!("gateway_active_connections").set(count as f64);
}

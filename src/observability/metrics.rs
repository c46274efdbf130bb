//! Metrics collection and exposition.
//!
//! # Metrics
//! - `front_connect_total` (counter): connect attempts by outcome
//! - `front_handshake_ms` (histogram): TLS handshake latency
//! - `front_pool_size` (gauge): pooled, unclaimed connections
//! - `front_workers` (gauge): live workers by protocol
//! - `front_tasks_total` (counter): finished tasks by outcome
//! - `front_task_duration_seconds` (histogram): task latency
//! - `front_task_retries_total` (counter): re-enqueued tasks
//! - `front_worker_closed_total` (counter): closed workers by reason
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op
//! - Prometheus exporter is optional and owned by the binary

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_connect(outcome: &'static str) {
    counter!("front_connect_total", "outcome" => outcome).increment(1);
}

pub fn record_handshake(handshake: Duration) {
    histogram!("front_handshake_ms").record(handshake.as_secs_f64() * 1000.0);
}

pub fn record_pool_size(size: usize) {
    gauge!("front_pool_size").set(size as f64);
}

pub fn record_workers(http1: usize, http2: usize) {
    gauge!("front_workers", "protocol" => "http/1.1").set(http1 as f64);
    gauge!("front_workers", "protocol" => "h2").set(http2 as f64);
}

pub fn record_task(outcome: &'static str, elapsed: Duration) {
    counter!("front_tasks_total", "outcome" => outcome).increment(1);
    histogram!("front_task_duration_seconds").record(elapsed.as_secs_f64());
}

pub fn record_retry() {
    counter!("front_task_retries_total").increment(1);
}

pub fn record_worker_closed(reason: &str) {
    counter!("front_worker_closed_total", "reason" => reason.to_string()).increment(1);
}

//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_requests_total` (counter): relayed HTTP requests by method, status
//! - `proxy_request_duration_seconds` (histogram): time to response headers
//! - `proxy_upstream_errors_total` (counter): upstream failures by kind
//! - `proxy_rate_limited_total` (counter): requests denied admission
//! - `proxy_active_connections` (gauge): open client connections
//! - `proxy_active_tunnels` (gauge): open WebSocket tunnels
//! - `proxy_tunnel_frames_total` (counter): relayed frames by direction
//!
//! Without an installed exporter every call here is a no-op.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::tunnel::RelaySummary;

/// Install the Prometheus exporter with its own scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install Prometheus metrics exporter"),
    }
}

pub fn record_request(method: &str, status: u16, start: Instant) {
    counter!(
        "proxy_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("proxy_request_duration_seconds").record(start.elapsed().as_secs_f64());
}

pub fn record_upstream_error(kind: &'static str) {
    counter!("proxy_upstream_errors_total", "kind" => kind).increment(1);
}

pub fn record_rate_limited() {
    counter!("proxy_rate_limited_total").increment(1);
}

pub fn connection_opened() {
    gauge!("proxy_active_connections").increment(1.0);
}

pub fn connection_closed() {
    gauge!("proxy_active_connections").decrement(1.0);
}

pub fn tunnel_opened() {
    gauge!("proxy_active_tunnels").increment(1.0);
}

pub fn tunnel_closed(summary: &RelaySummary) {
    gauge!("proxy_active_tunnels").decrement(1.0);
    counter!("proxy_tunnel_frames_total", "direction" => "to_upstream")
        .increment(summary.frames_to_upstream);
    counter!("proxy_tunnel_frames_total", "direction" => "to_client")
        .increment(summary.frames_to_client);
    counter!("proxy_tunnel_frames_total", "direction" => "dropped")
        .increment(summary.dropped_frames);
}

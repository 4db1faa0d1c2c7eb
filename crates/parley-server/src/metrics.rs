//! Metrics collection and export for Parley.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use parley_protocol::DeliveryStatus;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "parley_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "parley_connections_active";
    pub const CONNECTIONS_REJECTED: &str = "parley_connections_rejected_total";
    pub const MESSAGES_TOTAL: &str = "parley_messages_total";
    pub const SIGNALS_TOTAL: &str = "parley_signals_total";
    pub const EVICTIONS_TOTAL: &str = "parley_evictions_total";
    pub const ONLINE_USERS: &str = "parley_online_users";
    pub const LATENCY_SECONDS: &str = "parley_latency_seconds";
    pub const ERRORS_TOTAL: &str = "parley_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::CONNECTIONS_REJECTED,
        "Connection attempts refused before upgrade"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Direct messages routed, by status");
    metrics::describe_counter!(names::SIGNALS_TOTAL, "Typing signals relayed");
    metrics::describe_counter!(
        names::EVICTIONS_TOTAL,
        "Connections dropped after a failed send"
    );
    metrics::describe_gauge!(names::ONLINE_USERS, "Current number of online users");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Frame processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a refused connection attempt.
pub fn record_rejection(reason: &'static str) {
    counter!(names::CONNECTIONS_REJECTED, "reason" => reason).increment(1);
}

/// Record a routed message.
pub fn record_message(status: DeliveryStatus) {
    counter!(names::MESSAGES_TOTAL, "status" => status.as_str()).increment(1);
}

/// Record a relayed signal.
pub fn record_signal(delivered: bool) {
    let outcome = if delivered { "relayed" } else { "dropped" };
    counter!(names::SIGNALS_TOTAL, "outcome" => outcome).increment(1);
}

/// Publish lifecycle totals from the hub.
pub fn set_evictions(total: u64) {
    counter!(names::EVICTIONS_TOTAL).absolute(total);
}

/// Update online user count.
pub fn set_online_users(count: usize) {
    gauge!(names::ONLINE_USERS).set(count as f64);
}

/// Record frame processing latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorders_without_exporter() {
        // No recorder installed: every call is a no-op.
        let _guard = ConnectionMetricsGuard::new();
        record_message(DeliveryStatus::Delivered);
        record_signal(false);
        set_evictions(3);
        set_online_users(2);
        record_error("websocket");
    }
}

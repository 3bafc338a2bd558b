//! Metrics collection and export for Relay.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use relay_core::SessionSummary;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "relay_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
    pub const USERS_ONLINE: &str = "relay_users_online";
    pub const MESSAGES_TOTAL: &str = "relay_messages_total";
    pub const SESSIONS_CLOSED_TOTAL: &str = "relay_sessions_closed_total";
    pub const REST_REQUESTS_TOTAL: &str = "relay_rest_requests_total";
    pub const REST_LATENCY_SECONDS: &str = "relay_rest_latency_seconds";
    pub const ERRORS_TOTAL: &str = "relay_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    // Describe metrics
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_gauge!(
        names::USERS_ONLINE,
        "Current number of users with at least one connection"
    );
    metrics::describe_counter!(
        names::MESSAGES_TOTAL,
        "Inbound live messages by outcome"
    );
    metrics::describe_counter!(
        names::SESSIONS_CLOSED_TOTAL,
        "Closed sessions by reason"
    );
    metrics::describe_counter!(
        names::REST_REQUESTS_TOTAL,
        "REST requests by route and status"
    );
    metrics::describe_histogram!(
        names::REST_LATENCY_SECONDS,
        "REST request latency in seconds"
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

/// Update the online user count.
pub fn set_users_online(count: usize) {
    gauge!(names::USERS_ONLINE).set(count as f64);
}

/// Record the outcome counts of a finished session.
pub fn record_session(summary: &SessionSummary) {
    let outcomes = [
        ("routed", summary.routed),
        ("rate_limited", summary.rate_limited),
        ("dropped", summary.dropped),
        ("persist_failed", summary.persist_failed),
    ];
    for (outcome, count) in outcomes {
        if count > 0 {
            counter!(names::MESSAGES_TOTAL, "outcome" => outcome).increment(count);
        }
    }
    counter!(names::SESSIONS_CLOSED_TOTAL, "reason" => summary.reason.as_str()).increment(1);
}

/// Record a REST request.
pub fn record_rest_request(route: &'static str, status: u16, seconds: f64) {
    counter!(names::REST_REQUESTS_TOTAL, "route" => route, "status" => status.to_string())
        .increment(1);
    histogram!(names::REST_LATENCY_SECONDS, "route" => route).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
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

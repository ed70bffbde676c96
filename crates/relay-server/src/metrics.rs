//! Metrics collection and export for Relay.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const MESSAGES_PUBLISHED: &str = "relay_messages_published_total";
    pub const MESSAGES_DELIVERED: &str = "relay_messages_delivered_total";
    pub const MESSAGES_BYTES: &str = "relay_messages_bytes";
    pub const DUPLICATES_TOTAL: &str = "relay_duplicates_total";
    pub const POLLS_TOTAL: &str = "relay_polls_total";
    pub const TOPICS_ACTIVE: &str = "relay_topics_active";
    pub const CONSUMERS_ACTIVE: &str = "relay_consumers_active";
    pub const REQUEST_SECONDS: &str = "relay_request_seconds";
    pub const ERRORS_TOTAL: &str = "relay_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::MESSAGES_PUBLISHED,
        "Total number of messages accepted and persisted"
    );
    metrics::describe_counter!(
        names::MESSAGES_DELIVERED,
        "Total number of messages handed to consumer groups"
    );
    metrics::describe_counter!(
        names::MESSAGES_BYTES,
        "Total payload bytes of accepted messages"
    );
    metrics::describe_counter!(
        names::DUPLICATES_TOTAL,
        "Total number of duplicate publishes rejected"
    );
    metrics::describe_counter!(names::POLLS_TOTAL, "Total number of poll requests");
    metrics::describe_gauge!(names::TOPICS_ACTIVE, "Current number of topics");
    metrics::describe_gauge!(
        names::CONSUMERS_ACTIVE,
        "Current number of consumer registrations"
    );
    metrics::describe_histogram!(
        names::REQUEST_SECONDS,
        "Request handling latency in seconds"
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

/// Record a published message.
pub fn record_publish(bytes: usize) {
    counter!(names::MESSAGES_PUBLISHED).increment(1);
    counter!(names::MESSAGES_BYTES).increment(bytes as u64);
}

/// Record a rejected duplicate publish.
pub fn record_duplicate() {
    counter!(names::DUPLICATES_TOTAL).increment(1);
}

/// Record a poll and the number of messages it delivered.
pub fn record_poll(delivered: usize) {
    counter!(names::POLLS_TOTAL).increment(1);
    counter!(names::MESSAGES_DELIVERED).increment(delivered as u64);
}

/// Record request latency.
pub fn record_latency(op: &'static str, seconds: f64) {
    histogram!(names::REQUEST_SECONDS, "op" => op).record(seconds);
}

/// Update active topic count.
pub fn set_active_topics(count: usize) {
    gauge!(names::TOPICS_ACTIVE).set(count as f64);
}

/// Update active consumer count.
pub fn set_active_consumers(count: usize) {
    gauge!(names::CONSUMERS_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

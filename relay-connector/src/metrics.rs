//! Metrics definitions for the relay connector.
//!
//! This module defines all metrics keys used by the connector and provides a
//! helper [`describe_metrics`] to set metadata for each metric using the
//! `metrics` crate.

/// Metrics key for counting reconnect attempts.
pub const METRICS_ID_CONNECTOR_RECONNECTS: &str = "relay.connector.reconnects";
/// Metrics key for the number of upstream calls currently in flight.
pub const METRICS_ID_CONNECTOR_REQUESTS_INFLIGHT: &str = "relay.connector.requests.inflight";
/// Metrics key for counting relayed requests.
pub const METRICS_ID_CONNECTOR_REQUESTS_TOTAL: &str = "relay.connector.requests.total";
/// Metrics key for counting forwarded stream chunks.
pub const METRICS_ID_CONNECTOR_STREAM_CHUNKS: &str = "relay.connector.stream.chunks";
/// Metrics key for counting failed upstream calls.
pub const METRICS_ID_CONNECTOR_UPSTREAM_ERRORS: &str = "relay.connector.upstream.errors";

/// Describe all metrics used by the connector.
///
/// This calls the `describe_*` functions from the `metrics` crate to set
/// metadata on the different metrics.
pub fn describe_metrics() {
    metrics::describe_counter!(
        METRICS_ID_CONNECTOR_RECONNECTS,
        metrics::Unit::Count,
        "Number of reconnect attempts toward the broker"
    );

    metrics::describe_gauge!(
        METRICS_ID_CONNECTOR_REQUESTS_INFLIGHT,
        metrics::Unit::Count,
        "Number of upstream calls currently in flight"
    );

    metrics::describe_counter!(
        METRICS_ID_CONNECTOR_REQUESTS_TOTAL,
        metrics::Unit::Count,
        "Number of relayed requests"
    );

    metrics::describe_counter!(
        METRICS_ID_CONNECTOR_STREAM_CHUNKS,
        metrics::Unit::Count,
        "Number of stream chunks forwarded to the broker"
    );

    metrics::describe_counter!(
        METRICS_ID_CONNECTOR_UPSTREAM_ERRORS,
        metrics::Unit::Count,
        "Number of failed upstream calls"
    );
}

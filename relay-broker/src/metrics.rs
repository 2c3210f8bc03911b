//! Metrics definitions for the relay broker.
//!
//! This module defines all metrics keys used by the broker and provides a
//! helper [`describe_metrics`] to set metadata for each metric using the
//! `metrics` crate.

/// Metrics key for the number of currently authenticated connector sessions.
pub const METRICS_ID_BROKER_CONNECTORS: &str = "relay.broker.connectors.connected";
/// Metrics key for the number of requests currently in flight.
pub const METRICS_ID_BROKER_REQUESTS_INFLIGHT: &str = "relay.broker.requests.inflight";
/// Metrics key for counting accepted relay requests.
pub const METRICS_ID_BROKER_REQUESTS_TOTAL: &str = "relay.broker.requests.total";
/// Metrics key for the duration of completed relay requests.
pub const METRICS_ID_BROKER_REQUEST_DURATION: &str = "relay.broker.request.duration";
/// Metrics key for counting relayed stream chunks.
pub const METRICS_ID_BROKER_STREAM_CHUNKS: &str = "relay.broker.stream.chunks";
/// Metrics key for counting rejected connector authentications.
pub const METRICS_ID_BROKER_AUTH_FAILURES: &str = "relay.broker.auth.failures";
/// Metrics key for counting in-flight requests failed by session loss.
pub const METRICS_ID_BROKER_SESSIONS_LOST: &str = "relay.broker.sessions.lost";

/// Describe all metrics used by the broker.
///
/// This calls the `describe_*` functions from the `metrics` crate to set
/// metadata on the different metrics.
pub fn describe_metrics() {
    metrics::describe_gauge!(
        METRICS_ID_BROKER_CONNECTORS,
        metrics::Unit::Count,
        "Number of currently authenticated connector sessions"
    );

    metrics::describe_gauge!(
        METRICS_ID_BROKER_REQUESTS_INFLIGHT,
        metrics::Unit::Count,
        "Number of relay requests currently in flight"
    );

    metrics::describe_counter!(
        METRICS_ID_BROKER_REQUESTS_TOTAL,
        metrics::Unit::Count,
        "Number of accepted relay requests"
    );

    metrics::describe_histogram!(
        METRICS_ID_BROKER_REQUEST_DURATION,
        metrics::Unit::Milliseconds,
        "Duration of completed relay requests"
    );

    metrics::describe_counter!(
        METRICS_ID_BROKER_STREAM_CHUNKS,
        metrics::Unit::Count,
        "Number of relayed stream chunks"
    );

    metrics::describe_counter!(
        METRICS_ID_BROKER_AUTH_FAILURES,
        metrics::Unit::Count,
        "Number of rejected connector authentications"
    );

    metrics::describe_counter!(
        METRICS_ID_BROKER_SESSIONS_LOST,
        metrics::Unit::Count,
        "Number of in-flight requests failed because their session died"
    );
}

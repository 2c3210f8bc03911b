//! Configuration types and CLI/environment parsing for the relay connector.
//!
//! It can be configured via environment variables or command line arguments
//! using `clap`.

use std::time::Duration;

use clap::Parser;
use relay_types::limits::FrameLimits;
use secrecy::SecretString;

/// The configuration for the relay connector.
#[derive(Parser, Debug)]
pub struct ConnectorConfig {
    /// The URL of the broker duplex endpoint.
    #[clap(
        long,
        env = "RELAY_CONNECTOR_BROKER_URL",
        default_value = "ws://127.0.0.1:8444/ws"
    )]
    pub broker_url: String,

    /// The connector token presented at AUTH.
    #[clap(long, env = "RELAY_CONNECTOR_TOKEN")]
    pub token: SecretString,

    /// Model names this connector serves, in declaration order.
    #[clap(
        long = "model",
        env = "RELAY_CONNECTOR_MODELS",
        value_delimiter = ',',
        required = true
    )]
    pub models: Vec<String>,

    /// Base URL of the local OpenAI-compatible upstream.
    #[clap(
        long,
        env = "RELAY_CONNECTOR_UPSTREAM_URL",
        default_value = "http://127.0.0.1:11434"
    )]
    pub upstream_url: String,

    /// Max time to wait for AUTH_OK after connecting.
    #[clap(
        long,
        env = "RELAY_CONNECTOR_AUTH_TIMEOUT",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    pub auth_timeout: Duration,

    /// Deadline for one upstream call, including streamed responses.
    #[clap(
        long,
        env = "RELAY_CONNECTOR_UPSTREAM_TIMEOUT",
        default_value = "300s",
        value_parser = humantime::parse_duration
    )]
    pub upstream_timeout: Duration,

    /// Max time in-flight upstream calls may take after a stop signal.
    #[clap(
        long,
        env = "RELAY_CONNECTOR_DRAIN_TIMEOUT",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub drain_timeout: Duration,

    /// PING after this much writer idleness; PONG must arrive within the
    /// same interval.
    #[clap(
        long,
        env = "RELAY_CONNECTOR_HEARTBEAT_INTERVAL",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub heartbeat_interval: Duration,

    /// First reconnect delay; doubles per attempt with ±25% jitter.
    #[clap(
        long,
        env = "RELAY_CONNECTOR_BACKOFF_BASE",
        default_value = "1s",
        value_parser = humantime::parse_duration
    )]
    pub backoff_base: Duration,

    /// Upper bound for the reconnect delay.
    #[clap(
        long,
        env = "RELAY_CONNECTOR_BACKOFF_CAP",
        default_value = "60s",
        value_parser = humantime::parse_duration
    )]
    pub backoff_cap: Duration,

    /// Max decoded size of one STREAM_CHUNK body; larger chunks are split.
    #[clap(long, env = "RELAY_CONNECTOR_MAX_CHUNK_BYTES", default_value = "262144")]
    pub max_chunk_bytes: usize,

    /// Max decoded size of one REQUEST/RESPONSE body.
    #[clap(long, env = "RELAY_CONNECTOR_MAX_BODY_BYTES", default_value = "8388608")]
    pub max_body_bytes: usize,

    /// Outbound frame queue depth toward the broker.
    #[clap(long, env = "RELAY_CONNECTOR_OUTBOUND_QUEUE", default_value = "64")]
    pub outbound_queue: usize,
}

impl ConnectorConfig {
    /// The frame size caps the codec enforces on this connector.
    pub fn frame_limits(&self) -> FrameLimits {
        FrameLimits {
            max_chunk_bytes: self.max_chunk_bytes,
            max_body_bytes: self.max_body_bytes,
        }
    }
}

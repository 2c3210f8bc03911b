//! Configuration types and CLI/environment parsing for the relay broker.
//!
//! Every knob can be set via environment variables or command line arguments
//! using `clap`. Secrets (connector tokens, upstream credentials, user keys)
//! are parsed into types that never render their contents in `Debug` output.

use std::{fmt, net::SocketAddr, str::FromStr, time::Duration};

use clap::Parser;
use relay_types::limits::FrameLimits;
use secrecy::SecretString;
use semver::VersionReq;

/// One accepted connector token with its optional upstream credential.
///
/// Parsed from `token` or `token:credential`. The credential stays on the
/// broker and is injected into REQUEST frames only; it is never part of any
/// frame or log line that leaves toward the external caller.
#[derive(Clone)]
pub struct ConnectorTokenSpec {
    /// The token a connector presents at AUTH.
    pub token: String,
    /// The upstream credential bound to the token, if any.
    pub credential: Option<SecretString>,
}

impl FromStr for ConnectorTokenSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (token, credential) = match s.split_once(':') {
            Some((token, credential)) => (token, Some(SecretString::from(credential.to_owned()))),
            None => (s, None),
        };
        if token.is_empty() {
            return Err("connector token must not be empty".to_owned());
        }
        Ok(Self {
            token: token.to_owned(),
            credential,
        })
    }
}

impl fmt::Debug for ConnectorTokenSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorTokenSpec")
            .field("token", &"<redacted>")
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// The configuration for the relay broker.
///
/// It can be configured via environment variables or command line arguments
/// using `clap`.
#[derive(Parser, Debug)]
pub struct BrokerConfig {
    /// Bind address for the external OpenAI-compatible HTTP API.
    #[clap(long, env = "RELAY_BROKER_API_BIND_ADDR", default_value = "0.0.0.0:8443")]
    pub api_bind_addr: SocketAddr,

    /// Bind address for the connector duplex endpoint.
    #[clap(long, env = "RELAY_BROKER_WS_BIND_ADDR", default_value = "0.0.0.0:8444")]
    pub ws_bind_addr: SocketAddr,

    /// Bind address for the health endpoint.
    #[clap(
        long,
        env = "RELAY_BROKER_HEALTH_BIND_ADDR",
        default_value = "0.0.0.0:8080"
    )]
    pub health_bind_addr: SocketAddr,

    /// Accepted connector tokens, each as `token` or `token:upstream_credential`.
    #[clap(
        long = "connector-token",
        env = "RELAY_BROKER_CONNECTOR_TOKENS",
        value_delimiter = ',',
        required = true
    )]
    pub connector_tokens: Vec<ConnectorTokenSpec>,

    /// Accepted user API keys for the external HTTP surface.
    #[clap(
        long = "user-key",
        env = "RELAY_BROKER_USER_KEYS",
        value_delimiter = ',',
        required = true
    )]
    pub user_keys: Vec<SecretString>,

    /// Max time a connector may take to send its AUTH frame.
    #[clap(
        long,
        env = "RELAY_BROKER_AUTH_TIMEOUT",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    pub auth_timeout: Duration,

    /// Deadline for one relayed request, from REQUEST write to terminator.
    #[clap(
        long,
        env = "RELAY_BROKER_REQUEST_DEADLINE",
        default_value = "300s",
        value_parser = humantime::parse_duration
    )]
    pub request_deadline: Duration,

    /// Max time in-flight requests may take to finish after a stop signal.
    #[clap(
        long,
        env = "RELAY_BROKER_DRAIN_TIMEOUT",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub drain_timeout: Duration,

    /// Max message size the duplex endpoint accepts.
    ///
    /// Must leave room for a base64-encoded body at the request body cap.
    #[clap(
        long,
        env = "RELAY_BROKER_WS_MAX_MESSAGE_SIZE",
        default_value = "16777216"
    )]
    pub ws_max_message_size: usize,

    /// Max decoded size of one STREAM_CHUNK body.
    #[clap(long, env = "RELAY_BROKER_MAX_CHUNK_BYTES", default_value = "262144")]
    pub max_chunk_bytes: usize,

    /// Max decoded size of one REQUEST/RESPONSE body.
    #[clap(long, env = "RELAY_BROKER_MAX_BODY_BYTES", default_value = "8388608")]
    pub max_body_bytes: usize,

    /// Per-request chunk buffer; overflow cancels the request.
    #[clap(long, env = "RELAY_BROKER_CHUNK_BUFFER", default_value = "8")]
    pub chunk_buffer: usize,

    /// Per-session outbound frame queue depth.
    #[clap(long, env = "RELAY_BROKER_OUTBOUND_QUEUE", default_value = "64")]
    pub outbound_queue: usize,

    /// Accepted SemVer versions of connectors.
    #[clap(
        long,
        env = "RELAY_BROKER_ACCEPTED_VERSIONS",
        default_value = "*",
        value_parser = VersionReq::parse
    )]
    pub accepted_versions: VersionReq,
}

impl BrokerConfig {
    /// The frame size caps the codec enforces on this broker.
    pub fn frame_limits(&self) -> FrameLimits {
        FrameLimits {
            max_chunk_bytes: self.max_chunk_bytes,
            max_body_bytes: self.max_body_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_spec_parses_with_and_without_credential() {
        let bare: ConnectorTokenSpec = "t1".parse().expect("parses");
        assert_eq!(bare.token, "t1");
        assert!(bare.credential.is_none());

        let with: ConnectorTokenSpec = "t1:sk-upstream".parse().expect("parses");
        assert_eq!(with.token, "t1");
        assert!(with.credential.is_some());

        "".parse::<ConnectorTokenSpec>().expect_err("empty token");
    }

    #[test]
    fn token_spec_debug_is_redacted() {
        let spec: ConnectorTokenSpec = "t1:sk-upstream".parse().expect("parses");
        let rendered = format!("{spec:?}");
        assert!(!rendered.contains("t1"));
        assert!(!rendered.contains("sk-upstream"));
    }
}

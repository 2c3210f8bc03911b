//! The tagged frame type exchanged on the duplex transport.
//!
//! Every transport message carries exactly one [`Frame`]: a correlation
//! [`FrameId`](crate::FrameId), a `type` tag, and a type-specific payload.
//! Binary bodies are base64 strings on the wire (`body_b64`, `chunk_b64`);
//! all other fields are structured JSON.
//!
//! Two payloads carry secret material: [`AuthPayload::token`] and
//! [`RequestPayload::llm_api_key`]. Both types implement `Debug` by hand so
//! the secrets never reach logs.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{FrameId, SessionId, error_code::ErrorCode};

/// One envelope on the duplex transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Correlation id; stable for the lifetime of one relayed request.
    pub id: FrameId,
    /// The type tag plus type-specific payload.
    #[serde(flatten)]
    pub payload: Payload,
}

impl Frame {
    /// Wraps a payload under the given correlation id.
    pub fn new(id: FrameId, payload: Payload) -> Self {
        Self { id, payload }
    }

    /// Wraps an auth-handshake payload under the bootstrap id.
    pub fn bootstrap(payload: Payload) -> Self {
        Self::new(FrameId::bootstrap(), payload)
    }
}

/// The type-specific part of a [`Frame`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Payload {
    /// Connector → broker: first frame of a session.
    Auth(AuthPayload),
    /// Broker → connector: the session is authenticated.
    AuthOk {
        /// The broker-assigned session id.
        session_id: SessionId,
    },
    /// Broker → connector: the token was rejected; the transport closes.
    AuthFail {
        /// Human-readable rejection reason; never contains the token.
        error: String,
    },
    /// Broker → connector: relay this HTTP request to the local upstream.
    Request(RequestPayload),
    /// Connector → broker: complete non-streaming upstream response.
    Response(ResponsePayload),
    /// Connector → broker: one bounded piece of a streaming response.
    StreamChunk(StreamChunkPayload),
    /// Connector → broker: the streaming response ended cleanly.
    StreamEnd {
        /// Always `true`; kept on the wire for symmetry with chunks.
        done: bool,
    },
    /// Either direction: the request failed; terminal for its id.
    Error(ErrorPayload),
    /// Broker → connector: abandon the request; no further frames follow.
    Cancel {},
    /// Liveness probe; answered with PONG carrying the same id.
    Ping {},
    /// Liveness answer.
    Pong {},
}

impl Payload {
    /// Returns `true` iff this payload terminates its correlation id.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Payload::Response(_) | Payload::StreamEnd { .. } | Payload::Error(_)
        )
    }

    /// The clean end-of-stream marker.
    pub fn stream_end() -> Self {
        Payload::StreamEnd { done: true }
    }
}

/// Payload of an AUTH frame.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPayload {
    /// The connector token as configured on the broker.
    pub token: String,
    /// The connector's crate version.
    pub connector_version: String,
    /// Model names this connector serves, in declaration order.
    pub models: Vec<String>,
}

impl fmt::Debug for AuthPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthPayload")
            .field("token", &"<redacted>")
            .field("connector_version", &self.connector_version)
            .field("models", &self.models)
            .finish()
    }
}

/// Payload of a REQUEST frame.
///
/// Headers arrive sanitized: the broker strips the external caller's
/// `Authorization` before framing. `llm_api_key` is the broker-injected
/// upstream credential; the connector turns it into a bearer header on the
/// local leg and never persists it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPayload {
    /// HTTP method of the relayed request.
    pub method: String,
    /// Path and query of the relayed request.
    pub path: String,
    /// Sanitized header pairs in original order.
    pub headers: Vec<(String, String)>,
    /// Raw request body.
    #[serde(rename = "body_b64", with = "crate::b64")]
    pub body: Vec<u8>,
    /// Upstream credential to inject, if the token has one configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_api_key: Option<String>,
}

impl fmt::Debug for RequestPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestPayload")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("headers", &self.headers.len())
            .field("body_bytes", &self.body.len())
            .field("llm_api_key", &self.llm_api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Payload of a RESPONSE frame (complete non-streaming response).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponsePayload {
    /// Upstream HTTP status, passed through verbatim.
    pub status: u16,
    /// Upstream header pairs in original order.
    pub headers: Vec<(String, String)>,
    /// Raw response body.
    #[serde(rename = "body_b64", with = "crate::b64")]
    pub body: Vec<u8>,
}

/// Payload of a STREAM_CHUNK frame.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunkPayload {
    /// Raw chunk bytes, bounded by the negotiated chunk cap.
    #[serde(rename = "chunk_b64", with = "crate::b64")]
    pub chunk: Vec<u8>,
    /// Always `false`; the end of the stream is a dedicated frame.
    pub done: bool,
}

impl StreamChunkPayload {
    /// Wraps chunk bytes in a non-terminal chunk payload.
    pub fn new(chunk: Vec<u8>) -> Self {
        Self { chunk, done: false }
    }
}

impl fmt::Debug for StreamChunkPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamChunkPayload")
            .field("chunk_bytes", &self.chunk.len())
            .field("done", &self.done)
            .finish()
    }
}

/// Payload of an ERROR frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// HTTP status the broker should surface to the external caller.
    pub status: u16,
    /// Human-readable message, free of secret material.
    pub error: String,
    /// Machine-readable error code.
    pub code: ErrorCode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_debug_redacts_token() {
        let auth = AuthPayload {
            token: "super-secret".to_owned(),
            connector_version: "0.1.0".to_owned(),
            models: vec!["llama3.2".to_owned()],
        };
        let rendered = format!("{auth:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn request_debug_redacts_credential_and_body() {
        let request = RequestPayload {
            method: "POST".to_owned(),
            path: "/v1/chat/completions".to_owned(),
            headers: vec![("content-type".to_owned(), "application/json".to_owned())],
            body: b"{\"model\":\"llama3.2\"}".to_vec(),
            llm_api_key: Some("sk-upstream".to_owned()),
        };
        let rendered = format!("{request:?}");
        assert!(!rendered.contains("sk-upstream"));
        assert!(!rendered.contains("llama3.2"));
    }

    #[test]
    fn terminal_payloads() {
        assert!(Payload::stream_end().is_terminal());
        assert!(
            Payload::Error(ErrorPayload {
                status: 504,
                error: "deadline elapsed".to_owned(),
                code: ErrorCode::Timeout,
            })
            .is_terminal()
        );
        assert!(!Payload::Ping {}.is_terminal());
        assert!(!Payload::StreamChunk(StreamChunkPayload::new(vec![1])).is_terminal());
    }
}

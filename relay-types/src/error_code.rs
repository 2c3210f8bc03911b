//! The closed set of error codes the relay puts on the wire.
//!
//! Codes appear in ERROR frames and in the `code` field of HTTP error
//! bodies. They carry no secret material; human-readable messages travel
//! next to them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Machine-readable error code shared by frames and HTTP error bodies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The connector presented a token the broker does not accept.
    InvalidToken,
    /// The external caller presented an unknown user key.
    InvalidApiKey,
    /// No connector has ever declared the requested model.
    ModelNotFound,
    /// The model is known but no live session currently serves it.
    NoConnector,
    /// The owning connector session died while the request was in flight.
    SessionLost,
    /// The request deadline elapsed on either leg.
    Timeout,
    /// The connector could not reach its local upstream at all.
    LlmUnavailable,
    /// The upstream failed mid-request without a passthrough status.
    LlmError,
    /// A frame body exceeded the negotiated size cap.
    FrameTooLarge,
    /// The external caller stopped reading and the chunk buffer overflowed.
    SlowConsumer,
    /// The process is shutting down and drained this request forcibly.
    Shutdown,
    /// Any other internal failure.
    InternalError,
}

impl ErrorCode {
    /// Returns the snake_case wire representation of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidToken => "invalid_token",
            ErrorCode::InvalidApiKey => "invalid_api_key",
            ErrorCode::ModelNotFound => "model_not_found",
            ErrorCode::NoConnector => "no_connector",
            ErrorCode::SessionLost => "session_lost",
            ErrorCode::Timeout => "timeout",
            ErrorCode::LlmUnavailable => "llm_unavailable",
            ErrorCode::LlmError => "llm_error",
            ErrorCode::FrameTooLarge => "frame_too_large",
            ErrorCode::SlowConsumer => "slow_consumer",
            ErrorCode::Shutdown => "shutdown",
            ErrorCode::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_snake_case() {
        let json = serde_json::to_string(&ErrorCode::SessionLost).expect("serializes");
        assert_eq!(json, "\"session_lost\"");
        let back: ErrorCode = serde_json::from_str(&json).expect("deserializes");
        assert_eq!(back, ErrorCode::SessionLost);
    }

    #[test]
    fn display_matches_wire_form() {
        assert_eq!(ErrorCode::FrameTooLarge.to_string(), "frame_too_large");
    }
}

//! JSON codec for [`Frame`]s: one frame per transport text message.
//!
//! Encoding cannot fail for well-formed frames. Decoding validates the type
//! tag and payload schema via serde and then enforces the negotiated size
//! caps on decoded bodies; an oversized body is a decode error, not a frame.

use crate::frame::{Frame, Payload};
use crate::limits::FrameLimits;

/// Errors produced while decoding an inbound transport message.
///
/// On an authenticated session any decode error is fatal to that session.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Unknown type tag or payload that does not match the tag's schema.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// A declared body exceeds the negotiated cap.
    #[error("{kind} of {len} bytes exceeds cap of {max} bytes")]
    FrameTooLarge {
        /// Which body field overflowed.
        kind: &'static str,
        /// Decoded size of the offending body.
        len: usize,
        /// The violated cap.
        max: usize,
    },
}

/// Encodes a frame as a single JSON text message.
pub fn encode(frame: &Frame) -> String {
    serde_json::to_string(frame).expect("frames serialize to JSON")
}

/// Decodes a single text message into a frame, enforcing `limits`.
pub fn decode(text: &str, limits: &FrameLimits) -> Result<Frame, CodecError> {
    let frame: Frame = serde_json::from_str(text)?;
    match &frame.payload {
        Payload::Request(request) if request.body.len() > limits.max_body_bytes => {
            Err(CodecError::FrameTooLarge {
                kind: "request body",
                len: request.body.len(),
                max: limits.max_body_bytes,
            })
        }
        Payload::Response(response) if response.body.len() > limits.max_body_bytes => {
            Err(CodecError::FrameTooLarge {
                kind: "response body",
                len: response.body.len(),
                max: limits.max_body_bytes,
            })
        }
        Payload::StreamChunk(chunk) if chunk.chunk.len() > limits.max_chunk_bytes => {
            Err(CodecError::FrameTooLarge {
                kind: "stream chunk",
                len: chunk.chunk.len(),
                max: limits.max_chunk_bytes,
            })
        }
        _ => Ok(frame),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_code::ErrorCode;
    use crate::frame::{
        AuthPayload, ErrorPayload, RequestPayload, ResponsePayload, StreamChunkPayload,
    };
    use crate::{FrameId, SessionId};

    fn roundtrip(frame: Frame) {
        let encoded = encode(&frame);
        let decoded = decode(&encoded, &FrameLimits::default()).expect("decodes");
        assert_eq!(frame, decoded);
    }

    #[test]
    fn roundtrip_identity_on_all_variants() {
        roundtrip(Frame::bootstrap(Payload::Auth(AuthPayload {
            token: "t1".to_owned(),
            connector_version: "0.1.0".to_owned(),
            models: vec!["llama3.2".to_owned(), "qwen2.5".to_owned()],
        })));
        roundtrip(Frame::bootstrap(Payload::AuthOk {
            session_id: SessionId::fresh(),
        }));
        roundtrip(Frame::bootstrap(Payload::AuthFail {
            error: "invalid token".to_owned(),
        }));
        let id = FrameId::fresh();
        roundtrip(Frame::new(
            id.clone(),
            Payload::Request(RequestPayload {
                method: "POST".to_owned(),
                path: "/v1/chat/completions".to_owned(),
                headers: vec![("content-type".to_owned(), "application/json".to_owned())],
                body: vec![0, 159, 146, 150],
                llm_api_key: Some("sk-upstream".to_owned()),
            }),
        ));
        roundtrip(Frame::new(
            id.clone(),
            Payload::Response(ResponsePayload {
                status: 200,
                headers: vec![],
                body: b"{}".to_vec(),
            }),
        ));
        roundtrip(Frame::new(
            id.clone(),
            Payload::StreamChunk(StreamChunkPayload::new(b"data: {}\n\n".to_vec())),
        ));
        roundtrip(Frame::new(id.clone(), Payload::stream_end()));
        roundtrip(Frame::new(
            id.clone(),
            Payload::Error(ErrorPayload {
                status: 504,
                error: "deadline elapsed".to_owned(),
                code: ErrorCode::Timeout,
            }),
        ));
        roundtrip(Frame::new(id.clone(), Payload::Cancel {}));
        roundtrip(Frame::new(id.clone(), Payload::Ping {}));
        roundtrip(Frame::new(id, Payload::Pong {}));
    }

    #[test]
    fn wire_shape_matches_protocol() {
        let frame = Frame::new(
            FrameId::bootstrap(),
            Payload::AuthOk {
                session_id: SessionId::fresh(),
            },
        );
        let value: serde_json::Value = serde_json::from_str(&encode(&frame)).expect("is json");
        assert_eq!(value["type"], "AUTH_OK");
        assert_eq!(value["id"], "0");
        assert!(value["payload"]["session_id"].is_string());
    }

    #[test]
    fn body_field_is_base64() {
        let frame = Frame::new(
            FrameId::fresh(),
            Payload::StreamChunk(StreamChunkPayload::new(vec![0xff, 0x00, 0x01])),
        );
        let value: serde_json::Value = serde_json::from_str(&encode(&frame)).expect("is json");
        assert_eq!(value["payload"]["chunk_b64"], "/wAB");
        assert_eq!(value["payload"]["done"], false);
    }

    #[test]
    fn unknown_type_is_a_decode_error() {
        let err = decode(
            r#"{"id":"0","type":"SUBSCRIBE","payload":{}}"#,
            &FrameLimits::default(),
        )
        .expect_err("unknown tag");
        assert!(matches!(err, CodecError::Json(_)));
    }

    #[test]
    fn malformed_payload_is_a_decode_error() {
        // AUTH without its mandatory fields
        let err = decode(
            r#"{"id":"0","type":"AUTH","payload":{"token":"t1"}}"#,
            &FrameLimits::default(),
        )
        .expect_err("schema mismatch");
        assert!(matches!(err, CodecError::Json(_)));
    }

    #[test]
    fn chunk_at_cap_passes_one_over_fails() {
        let limits = FrameLimits {
            max_chunk_bytes: 8,
            max_body_bytes: 16,
        };
        let at_cap = Frame::new(
            FrameId::fresh(),
            Payload::StreamChunk(StreamChunkPayload::new(vec![7u8; 8])),
        );
        decode(&encode(&at_cap), &limits).expect("cap-sized chunk decodes");

        let over = Frame::new(
            FrameId::fresh(),
            Payload::StreamChunk(StreamChunkPayload::new(vec![7u8; 9])),
        );
        let err = decode(&encode(&over), &limits).expect_err("oversized chunk rejected");
        assert!(matches!(
            err,
            CodecError::FrameTooLarge { len: 9, max: 8, .. }
        ));
    }

    #[test]
    fn request_body_cap_is_enforced() {
        let limits = FrameLimits {
            max_chunk_bytes: 8,
            max_body_bytes: 16,
        };
        let over = Frame::new(
            FrameId::fresh(),
            Payload::Request(RequestPayload {
                method: "POST".to_owned(),
                path: "/v1/chat/completions".to_owned(),
                headers: vec![],
                body: vec![0u8; 17],
                llm_api_key: None,
            }),
        );
        let err = decode(&encode(&over), &limits).expect_err("oversized body rejected");
        assert!(matches!(err, CodecError::FrameTooLarge { max: 16, .. }));
    }
}

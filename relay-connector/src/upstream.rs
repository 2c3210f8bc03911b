//! Forwarding REQUEST frames to the local OpenAI-compatible upstream.
//!
//! One task per relayed request: reconstruct the HTTP request, inject the
//! broker-provided credential, and relay the response back as either a
//! single RESPONSE frame or a sequence of STREAM_CHUNK frames terminated by
//! STREAM_END. Upstream chunks larger than the negotiated cap are split;
//! they are never rejected on this side.
//!
//! A cancelled request emits nothing: the broker treats its CANCEL as the
//! terminator for the correlation id.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt as _;
use relay_types::FrameId;
use relay_types::error_code::ErrorCode;
use relay_types::frame::{
    ErrorPayload, Frame, Payload, RequestPayload, ResponsePayload, StreamChunkPayload,
};
use relay_types::limits::FrameLimits;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, TRANSFER_ENCODING};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::metrics::{METRICS_ID_CONNECTOR_STREAM_CHUNKS, METRICS_ID_CONNECTOR_UPSTREAM_ERRORS};

/// Everything an upstream task needs, shared across the session.
pub(crate) struct UpstreamContext {
    pub(crate) http: reqwest::Client,
    pub(crate) base_url: String,
    pub(crate) timeout: Duration,
    pub(crate) limits: FrameLimits,
    pub(crate) outbound: mpsc::Sender<Frame>,
}

impl UpstreamContext {
    async fn send(&self, frame: Frame) -> Result<(), UpstreamError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| UpstreamError::SessionGone)
    }
}

#[derive(Debug, thiserror::Error)]
enum UpstreamError {
    #[error("upstream unreachable: {0}")]
    Connect(reqwest::Error),
    #[error("upstream failed mid-stream: {0}")]
    MidStream(reqwest::Error),
    #[error("upstream body of {len} bytes exceeds cap of {max} bytes")]
    BodyTooLarge { len: usize, max: usize },
    #[error("invalid method in REQUEST frame")]
    BadMethod,
    #[error("session is gone")]
    SessionGone,
}

impl UpstreamError {
    /// The terminal ERROR frame for this failure; `None` when the session is
    /// gone and nothing can be written anymore.
    fn into_error_payload(self) -> Option<ErrorPayload> {
        let (status, code) = match self {
            UpstreamError::Connect(_) => (502, ErrorCode::LlmUnavailable),
            UpstreamError::MidStream(_) => (502, ErrorCode::LlmError),
            UpstreamError::BodyTooLarge { .. } => (413, ErrorCode::FrameTooLarge),
            UpstreamError::BadMethod => (500, ErrorCode::InternalError),
            UpstreamError::SessionGone => return None,
        };
        Some(ErrorPayload {
            status,
            error: self.to_string(),
            code,
        })
    }
}

/// Runs one relayed request to completion, cancellation, or timeout.
pub(crate) async fn handle_request(
    ctx: Arc<UpstreamContext>,
    id: FrameId,
    request: RequestPayload,
    cancel: CancellationToken,
) {
    let result = tokio::select! {
        // CANCEL is advisory but must release upstream resources promptly;
        // dropping the call future aborts the HTTP request
        _ = cancel.cancelled() => return,
        result = tokio::time::timeout(ctx.timeout, relay_upstream(&ctx, &id, request)) => result,
    };
    let error = match result {
        Ok(Ok(())) => return,
        Ok(Err(err)) => {
            tracing::debug!(%id, "upstream call failed: {err:?}");
            err.into_error_payload()
        }
        Err(_) => Some(ErrorPayload {
            status: 504,
            error: "upstream deadline elapsed".to_owned(),
            code: ErrorCode::Timeout,
        }),
    };
    let Some(error) = error else { return };
    ::metrics::counter!(METRICS_ID_CONNECTOR_UPSTREAM_ERRORS).increment(1);
    let _ = ctx.outbound.send(Frame::new(id, Payload::Error(error))).await;
}

async fn relay_upstream(
    ctx: &UpstreamContext,
    id: &FrameId,
    request: RequestPayload,
) -> Result<(), UpstreamError> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .map_err(|_| UpstreamError::BadMethod)?;
    let url = format!(
        "{}{}",
        ctx.base_url.trim_end_matches('/'),
        request.path
    );

    let mut builder = ctx.http.request(method, url);
    for (name, value) in &request.headers {
        if matches!(
            name.to_ascii_lowercase().as_str(),
            "host" | "content-length" | "connection"
        ) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(key) = &request.llm_api_key {
        // overwrites any inherited value
        builder = builder.header(AUTHORIZATION, format!("Bearer {key}"));
    }

    let response = builder
        .body(request.body)
        .send()
        .await
        .map_err(UpstreamError::Connect)?;
    let status = response.status().as_u16();

    if is_streaming(response.headers()) {
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(UpstreamError::MidStream)?;
            for piece in split_chunks(&chunk, ctx.limits.max_chunk_bytes) {
                ::metrics::counter!(METRICS_ID_CONNECTOR_STREAM_CHUNKS).increment(1);
                ctx.send(Frame::new(
                    id.clone(),
                    Payload::StreamChunk(StreamChunkPayload::new(piece)),
                ))
                .await?;
            }
        }
        ctx.send(Frame::new(id.clone(), Payload::stream_end()))
            .await?;
    } else {
        let headers = response_headers(response.headers());
        let body = response.bytes().await.map_err(UpstreamError::MidStream)?;
        if body.len() > ctx.limits.max_body_bytes {
            return Err(UpstreamError::BodyTooLarge {
                len: body.len(),
                max: ctx.limits.max_body_bytes,
            });
        }
        ctx.send(Frame::new(
            id.clone(),
            Payload::Response(ResponsePayload {
                status,
                headers,
                body: body.to_vec(),
            }),
        ))
        .await?;
    }
    Ok(())
}

/// A response streams iff it is SSE or uses chunked transfer encoding.
fn is_streaming(headers: &HeaderMap) -> bool {
    let sse = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"));
    let chunked = headers
        .get(TRANSFER_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("chunked"));
    sse || chunked
}

fn response_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            Some((name.as_str().to_owned(), value.to_str().ok()?.to_owned()))
        })
        .collect()
}

/// Splits upstream bytes at the per-chunk cap.
fn split_chunks(bytes: &[u8], max: usize) -> impl Iterator<Item = Vec<u8>> + '_ {
    bytes.chunks(max.max(1)).map(<[u8]>::to_vec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_at_the_cap_stays_whole_one_over_is_split() {
        let at_cap = vec![1u8; 8];
        assert_eq!(split_chunks(&at_cap, 8).count(), 1);

        let over = vec![1u8; 9];
        let pieces = split_chunks(&over, 8).collect::<Vec<_>>();
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0].len(), 8);
        assert_eq!(pieces[1].len(), 1);
        assert_eq!(pieces.concat(), over);
    }

    #[test]
    fn empty_upstream_chunks_produce_no_frames() {
        assert_eq!(split_chunks(&[], 8).count(), 0);
    }

    #[test]
    fn sse_and_chunked_responses_stream() {
        let mut headers = HeaderMap::new();
        assert!(!is_streaming(&headers));

        headers.insert(CONTENT_TYPE, "application/json".parse().expect("value"));
        assert!(!is_streaming(&headers));

        headers.insert(
            CONTENT_TYPE,
            "text/event-stream; charset=utf-8".parse().expect("value"),
        );
        assert!(is_streaming(&headers));

        headers.remove(CONTENT_TYPE);
        headers.insert(TRANSFER_ENCODING, "chunked".parse().expect("value"));
        assert!(is_streaming(&headers));
    }

    #[test]
    fn failures_map_to_terminal_error_payloads() {
        let payload = UpstreamError::BadMethod
            .into_error_payload()
            .expect("payload");
        assert_eq!(payload.code, ErrorCode::InternalError);

        assert!(UpstreamError::SessionGone.into_error_payload().is_none());

        let payload = UpstreamError::BodyTooLarge { len: 9, max: 8 }
            .into_error_payload()
            .expect("payload");
        assert_eq!(payload.status, 413);
        assert_eq!(payload.code, ErrorCode::FrameTooLarge);
    }
}

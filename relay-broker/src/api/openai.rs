//! The external OpenAI-compatible surface.
//!
//! This layer is intentionally thin: parse authorization, probe the body for
//! `model` and `stream`, consult the router, hand off to the session's
//! in-flight table, and translate terminal frames into HTTP terminators.
//! Response bytes pass through verbatim; for SSE the final `data: [DONE]`
//! line is appended on STREAM_END unless the upstream already sent one.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse as _, Response};
use axum::routing::{get, post};
use axum::Router;
use relay_types::FrameId;
use relay_types::frame::{Frame, Payload, RequestPayload, ResponsePayload};
use relay_types::limits::FrameLimits;
use secrecy::{ExposeSecret as _, SecretString};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::api::errors::ApiError;
use crate::metrics::{METRICS_ID_BROKER_REQUEST_DURATION, METRICS_ID_BROKER_REQUESTS_TOTAL};
use crate::services::inflight::{ResponseSink, StreamEvent, UnaryOutcome};
use crate::services::registry::{ConnectorHandle, ConnectorRegistry};
use crate::services::router::ModelRouter;

const DONE_EVENT: &[u8] = b"data: [DONE]\n\n";
const DONE_SENTINEL: &[u8] = b"data: [DONE]";

/// Shared state of the external API.
#[derive(Clone)]
pub(crate) struct OpenAiApi {
    pub(crate) router: ModelRouter,
    pub(crate) registry: ConnectorRegistry,
    pub(crate) user_keys: Arc<Vec<SecretString>>,
    pub(crate) request_deadline: Duration,
    pub(crate) limits: FrameLimits,
    pub(crate) chunk_buffer: usize,
}

/// Creates the router for the OpenAI-compatible endpoints.
pub(crate) fn routes(api: OpenAiApi) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(models))
        .with_state(api)
}

/// Just enough of the request body to route it; everything else is opaque.
#[derive(Debug, Deserialize)]
struct CompletionProbe {
    model: String,
    #[serde(default)]
    stream: bool,
}

/// Removes the in-flight record and cancels upstream if the handler goes
/// away before a terminal frame arrived (caller abort, deadline).
struct InflightGuard {
    handle: Arc<ConnectorHandle>,
    id: FrameId,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if self.handle.inflight().remove(&self.id).is_some() {
            self.handle.enqueue_cancel(self.id.clone());
        }
    }
}

async fn models(
    State(api): State<OpenAiApi>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&api, &headers)?;
    let data = api
        .router
        .models()
        .into_iter()
        .map(|model| json!({ "id": model, "object": "model" }))
        .collect::<Vec<_>>();
    Ok(Json(json!({ "object": "list", "data": data })))
}

async fn chat_completions(
    State(api): State<OpenAiApi>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    authorize(&api, &headers)?;
    if body.len() > api.limits.max_body_bytes {
        return Err(ApiError::BodyTooLarge {
            len: body.len(),
            max: api.limits.max_body_bytes,
        });
    }
    // a body we cannot probe has no routable model
    let probe = serde_json::from_slice::<CompletionProbe>(&body)
        .map_err(|_| ApiError::ModelNotFound)?;

    let route = api.router.get_route(&probe.model)?;
    let handle = api
        .registry
        .get(route.session_id)
        .ok_or(ApiError::NoConnector)?;

    ::metrics::counter!(METRICS_ID_BROKER_REQUESTS_TOTAL).increment(1);
    let id = FrameId::fresh();
    let request = RequestPayload {
        method: "POST".to_owned(),
        path: "/v1/chat/completions".to_owned(),
        headers: sanitized_headers(&headers),
        body: body.to_vec(),
        llm_api_key: route
            .credential
            .as_ref()
            .map(|credential| credential.expose_secret().to_owned()),
    };

    tracing::debug!(%id, model = %probe.model, stream = probe.stream, "relaying request");
    if probe.stream {
        relay_streaming(api, handle, id, request).await
    } else {
        relay_unary(api, handle, id, request).await
    }
}

/// `stream:false`: wait for the single RESPONSE and pass it through.
async fn relay_unary(
    api: OpenAiApi,
    handle: Arc<ConnectorHandle>,
    id: FrameId,
    request: RequestPayload,
) -> Result<Response, ApiError> {
    let started = Instant::now();
    let (slot, outcome) = oneshot::channel();
    handle.inflight().insert(id.clone(), ResponseSink::Unary(slot));
    let _guard = InflightGuard {
        handle: Arc::clone(&handle),
        id: id.clone(),
    };
    handle
        .send(Frame::new(id, Payload::Request(request)))
        .await
        .map_err(|_| ApiError::SessionLost)?;

    match tokio::time::timeout(api.request_deadline, outcome).await {
        Ok(Ok(UnaryOutcome::Response(response))) => {
            ::metrics::histogram!(METRICS_ID_BROKER_REQUEST_DURATION)
                .record(started.elapsed().as_millis() as f64);
            Ok(unary_response(response))
        }
        Ok(Ok(UnaryOutcome::Error(error))) => Err(error.into()),
        // the slot was dropped without an outcome: the session died
        Ok(Err(_)) => Err(ApiError::SessionLost),
        // the guard removes the record and sends CANCEL on drop
        Err(_) => Err(ApiError::Timeout),
    }
}

/// Builds the passthrough response for a RESPONSE frame.
fn unary_response(response: ResponsePayload) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY));
    for (name, value) in &response.headers {
        if matches!(
            name.to_ascii_lowercase().as_str(),
            "content-length" | "transfer-encoding" | "connection"
        ) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
        .body(Body::from(response.body))
        .unwrap_or_else(|_| {
            // a header pair the upstream sent was not valid HTTP
            ApiError::Internal.into_response()
        })
}

/// `stream:true`: copy chunks into the response body as they arrive.
///
/// One deadline covers the request from REQUEST write to terminator; a
/// connector that keeps dripping chunks cannot extend it.
async fn relay_streaming(
    api: OpenAiApi,
    handle: Arc<ConnectorHandle>,
    id: FrameId,
    request: RequestPayload,
) -> Result<Response, ApiError> {
    let started = Instant::now();
    let deadline = started + api.request_deadline;
    let (chunks, mut events) = mpsc::channel(api.chunk_buffer);
    handle
        .inflight()
        .insert(id.clone(), ResponseSink::Stream(chunks));
    let guard = InflightGuard {
        handle: Arc::clone(&handle),
        id: id.clone(),
    };
    handle
        .send(Frame::new(id, Payload::Request(request)))
        .await
        .map_err(|_| ApiError::SessionLost)?;

    // the first event decides between an HTTP error and a 200 stream
    let state = match tokio::time::timeout_at(deadline, events.recv()).await {
        Ok(Some(StreamEvent::Chunk(bytes))) => SseState {
            events,
            tracker: DoneTracker::default(),
            _guard: guard,
            deadline,
            pending: Some(Bytes::from(bytes)),
            finished: false,
        },
        Ok(Some(StreamEvent::End)) => {
            // empty upstream stream: only the termination sentinel
            return sse_response(Body::from(Bytes::from_static(DONE_EVENT)));
        }
        Ok(Some(StreamEvent::Error(error))) => return Err(error.into()),
        Ok(None) => return Err(ApiError::SessionLost),
        Err(_) => return Err(ApiError::Timeout),
    };
    ::metrics::histogram!(METRICS_ID_BROKER_REQUEST_DURATION)
        .record(started.elapsed().as_millis() as f64);

    let stream = futures::stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        if let Some(bytes) = state.pending.take() {
            state.tracker.observe(&bytes);
            return Some((Ok::<_, Infallible>(bytes), state));
        }
        match tokio::time::timeout_at(state.deadline, state.events.recv()).await {
            Ok(Some(StreamEvent::Chunk(bytes))) => {
                let bytes = Bytes::from(bytes);
                state.tracker.observe(&bytes);
                Some((Ok(bytes), state))
            }
            Ok(Some(StreamEvent::End)) => {
                state.finished = true;
                if state.tracker.saw_done() {
                    None
                } else {
                    Some((Ok(Bytes::from_static(DONE_EVENT)), state))
                }
            }
            // mid-stream failure, session loss, or deadline expiry:
            // terminate the stream without the DONE sentinel
            Ok(Some(StreamEvent::Error(_))) | Ok(None) | Err(_) => None,
        }
    });

    sse_response(Body::from_stream(stream))
}

fn sse_response(body: Body) -> Result<Response, ApiError> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .map_err(|_| ApiError::Internal)
}

/// State threaded through the SSE passthrough stream.
struct SseState {
    events: mpsc::Receiver<StreamEvent>,
    tracker: DoneTracker,
    _guard: InflightGuard,
    /// Absolute request deadline, armed before the REQUEST write.
    deadline: Instant,
    pending: Option<Bytes>,
    finished: bool,
}

/// Tracks whether the relayed bytes already ended with `data: [DONE]`.
///
/// Chunk boundaries are arbitrary, so the tracker keeps a rolling tail a
/// little longer than the sentinel.
#[derive(Default)]
struct DoneTracker {
    tail: Vec<u8>,
}

impl DoneTracker {
    const TAIL: usize = 24;

    fn observe(&mut self, chunk: &[u8]) {
        self.tail.extend_from_slice(chunk);
        if self.tail.len() > Self::TAIL {
            self.tail.drain(..self.tail.len() - Self::TAIL);
        }
    }

    fn saw_done(&self) -> bool {
        self.tail.trim_ascii_end().ends_with(DONE_SENTINEL)
    }
}

fn authorize(api: &OpenAiApi, headers: &HeaderMap) -> Result<(), ApiError> {
    let presented = bearer_token(headers).ok_or(ApiError::InvalidApiKey)?;
    if api
        .user_keys
        .iter()
        .any(|key| key.expose_secret() == presented)
    {
        Ok(())
    } else {
        Err(ApiError::InvalidApiKey)
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Headers forwarded to the connector; routing and credential headers are
/// stripped before framing.
fn sanitized_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            if matches!(
                name.as_str(),
                "authorization" | "host" | "content-length" | "connection"
            ) {
                return None;
            }
            Some((name.as_str().to_owned(), value.to_str().ok()?.to_owned()))
        })
        .collect()
}

//! The connector duplex endpoint.
//!
//! Connectors dial `/ws`, present their protocol version in a header, and
//! must send AUTH as their first frame within the auth timeout. After
//! AUTH_OK the session runs a reader (this task) and a writer task; the
//! writer drains the session's bounded outbound queue and is the only
//! producer of bytes on the socket.
//!
//! On transport loss the registration is removed from the router first, so
//! no new REQUEST can be issued toward the dead socket, and only then are
//! the session's in-flight requests failed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{self, CloseFrame, WebSocket, close_code};
use axum::extract::WebSocketUpgrade;
use axum::response::IntoResponse;
use axum::routing::any;
use axum::Router;
use axum_extra::headers::Header;
use axum_extra::{TypedHeader, headers};
use futures::{SinkExt as _, StreamExt as _};
use http::{HeaderValue, StatusCode};
use relay_types::codec::{self, CodecError};
use relay_types::error_code::ErrorCode;
use relay_types::frame::{ErrorPayload, Frame, Payload, StreamChunkPayload};
use relay_types::limits::FrameLimits;
use relay_types::{FrameId, SessionId};
use secrecy::SecretString;
use semver::VersionReq;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument as _, instrument};

use crate::metrics::{METRICS_ID_BROKER_AUTH_FAILURES, METRICS_ID_BROKER_SESSIONS_LOST};
use crate::services::inflight::{ResponseSink, StreamEvent, UnaryOutcome};
use crate::services::registry::{ConnectorHandle, ConnectorRegistry};
use crate::services::router::ModelRouter;

/// A custom header connectors send to indicate their protocol version.
#[derive(Debug, Clone)]
pub(crate) struct ProtocolVersion(semver::Version);

impl Header for ProtocolVersion {
    fn name() -> &'static http::HeaderName {
        &relay_types::RELAY_PROTOCOL_VERSION_HEADER
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, axum_extra::headers::Error>
    where
        Self: Sized,
        I: Iterator<Item = &'i http::HeaderValue>,
    {
        let value = values
            .next()
            .ok_or_else(headers::Error::invalid)?
            .to_str()
            .map_err(|err| {
                tracing::trace!("could not convert header to string: {err:?}");
                headers::Error::invalid()
            })?;
        if values.next().is_some() {
            return Err(headers::Error::invalid());
        }
        let version = semver::Version::parse(value).map_err(|err| {
            tracing::trace!("could not parse header version: {err:?}");
            headers::Error::invalid()
        })?;
        Ok(ProtocolVersion(version))
    }

    fn encode<E: Extend<http::HeaderValue>>(&self, values: &mut E) {
        let encoded = HeaderValue::from_bytes(self.0.to_string().as_bytes())
            .expect("semver versions are valid header values");
        values.extend(std::iter::once(encoded));
    }
}

/// Everything the duplex endpoint needs, cloned into each upgrade.
#[derive(Clone)]
pub(crate) struct ConnectorEndpoint {
    pub(crate) registry: ConnectorRegistry,
    pub(crate) router: ModelRouter,
    /// Accepted connector tokens with their bound upstream credentials.
    pub(crate) tokens: Arc<HashMap<String, Option<SecretString>>>,
    pub(crate) limits: FrameLimits,
    pub(crate) auth_timeout: Duration,
    pub(crate) ws_max_message_size: usize,
    pub(crate) outbound_queue: usize,
    pub(crate) version_req: VersionReq,
}

/// Errors that end a connector session.
#[derive(Debug, thiserror::Error)]
enum SessionError {
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error(transparent)]
    Axum(#[from] axum::Error),
    #[error(transparent)]
    Decode(#[from] CodecError),
    #[error("unexpected message")]
    UnexpectedMessage,
}

/// Creates a `Router` with the single `/ws` route.
///
/// Connectors upgrade via the web-socket upgrade protocol; we accept the
/// route with `any` so both HTTP/1.1 and HTTP/2.0 upgrades work.
pub(crate) fn routes(endpoint: ConnectorEndpoint) -> Router {
    Router::new().route(
        "/ws",
        any(move |websocket_upgrade, version_header| {
            let TypedHeader(ProtocolVersion(connector_version)) = version_header;
            ws(endpoint.clone(), websocket_upgrade, connector_version)
        }),
    )
}

/// Web-socket handler.
///
/// Rejects version mismatches before the upgrade, caps the message size, and
/// hands the upgraded socket to the session lifecycle.
#[instrument(level = "debug", skip_all, name = "connector", fields(version = %connector_version))]
async fn ws(
    endpoint: ConnectorEndpoint,
    websocket_upgrade: WebSocketUpgrade,
    connector_version: semver::Version,
) -> axum::response::Response {
    if !endpoint.version_req.matches(&connector_version) {
        tracing::debug!("rejecting because version mismatch");
        return (
            StatusCode::BAD_REQUEST,
            format!("invalid version, expected: {}", endpoint.version_req),
        )
            .into_response();
    }
    let parent_span = tracing::Span::current();
    websocket_upgrade
        .max_message_size(endpoint.ws_max_message_size)
        .on_failed_upgrade(|err| {
            tracing::warn!("could not establish websocket connection: {err:?}");
        })
        .on_upgrade(move |socket| handle_session(endpoint, socket).instrument(parent_span))
}

/// The whole life-cycle of one connector session.
///
/// 1) Read the AUTH frame within the auth timeout; validate the token.
/// 2) Allocate a session id, register with the router, reply AUTH_OK.
/// 3) Run the reader/writer pair until the transport dies or shutdown.
/// 4) Unregister from the router, then fail all in-flight requests.
#[instrument(level = "debug", skip_all, fields(session_id = tracing::field::Empty))]
async fn handle_session(endpoint: ConnectorEndpoint, mut socket: WebSocket) {
    let auth = match tokio::time::timeout(
        endpoint.auth_timeout,
        read_frame(&mut socket, &endpoint.limits),
    )
    .await
    {
        Ok(Ok(frame)) => frame,
        Ok(Err(err)) => {
            tracing::debug!("connector hung up before AUTH: {err:?}");
            return;
        }
        Err(_) => {
            tracing::warn!("no AUTH frame within {:?}", endpoint.auth_timeout);
            return;
        }
    };
    if !auth.id.is_bootstrap() {
        tracing::warn!(id = %auth.id, "AUTH frame with a non-bootstrap id");
    }
    let Payload::Auth(auth) = auth.payload else {
        reject(&mut socket, "expected AUTH as first frame").await;
        return;
    };
    let Some(credential) = endpoint.tokens.get(&auth.token).cloned() else {
        ::metrics::counter!(METRICS_ID_BROKER_AUTH_FAILURES).increment(1);
        tracing::warn!("connector presented an unknown token");
        reject(&mut socket, "invalid token").await;
        return;
    };

    // session lifetime is bound to the transport, not to the broker-wide
    // stop signal: a draining broker keeps serving in-flight requests
    let session_id = SessionId::fresh();
    tracing::Span::current().record("session_id", session_id.to_string());
    let cancel = CancellationToken::new();
    let (handle, outbound_rx) = ConnectorHandle::new(
        session_id,
        auth.models.clone(),
        endpoint.outbound_queue,
        cancel.clone(),
    );

    endpoint.registry.insert(Arc::clone(&handle));
    endpoint
        .router
        .on_register(session_id, handle.models(), credential);
    tracing::info!(
        connector_version = %auth.connector_version,
        models = ?handle.models(),
        "connector authenticated"
    );

    let result = run_session(socket, &handle, outbound_rx, &endpoint).await;

    // Unregister before failing in-flights: no new REQUEST may be issued
    // toward this session once the teardown has started.
    endpoint.router.on_unregister(session_id);
    endpoint.registry.remove(session_id);
    let lost = handle.inflight().len();
    if lost > 0 {
        ::metrics::counter!(METRICS_ID_BROKER_SESSIONS_LOST).increment(lost as u64);
    }
    handle.inflight().fail_all(&ErrorPayload {
        status: 503,
        error: "connector session lost".to_owned(),
        code: ErrorCode::SessionLost,
    });
    cancel.cancel();

    match result {
        Ok(()) => tracing::info!("connector session closed"),
        Err(err) => tracing::warn!("connector session failed: {err:?}"),
    }
}

/// Runs the authenticated phase: writer task plus reader loop.
async fn run_session(
    mut socket: WebSocket,
    handle: &Arc<ConnectorHandle>,
    mut outbound_rx: mpsc::Receiver<Frame>,
    endpoint: &ConnectorEndpoint,
) -> Result<(), SessionError> {
    let auth_ok = Frame::bootstrap(Payload::AuthOk {
        session_id: handle.session_id(),
    });
    socket
        .send(ws::Message::text(codec::encode(&auth_ok)))
        .await?;

    let (mut sink, mut stream) = socket.split();
    let writer_cancel = handle.cancel_token().clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => break,
                frame = outbound_rx.recv() => match frame {
                    Some(frame) => {
                        if sink
                            .send(ws::Message::text(codec::encode(&frame)))
                            .await
                            .is_err()
                        {
                            writer_cancel.cancel();
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        // closing handshake on a best-effort basis
        let _ = sink
            .send(ws::Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: "session over".into(),
            })))
            .await;
    });

    let result = loop {
        tokio::select! {
            _ = handle.cancel_token().cancelled() => break Ok(()),
            msg = stream.next() => {
                let frame = match msg {
                    None => break Ok(()),
                    Some(Err(err)) => break Err(SessionError::from(err)),
                    Some(Ok(ws::Message::Text(text))) => {
                        match codec::decode(text.as_str(), &endpoint.limits) {
                            Ok(frame) => frame,
                            // decode failure on an authenticated session is fatal
                            Err(err) => break Err(SessionError::from(err)),
                        }
                    }
                    Some(Ok(ws::Message::Close(_))) => break Ok(()),
                    Some(Ok(ws::Message::Ping(_) | ws::Message::Pong(_))) => continue,
                    Some(Ok(ws::Message::Binary(_))) => break Err(SessionError::UnexpectedMessage),
                };
                dispatch(frame, handle).await;
            }
        }
    };
    handle.cancel_token().cancel();
    let _ = writer.await;
    result
}

/// Routes one inbound frame to the matching in-flight record.
///
/// Frames with unknown correlation ids are dropped with a warning; they may
/// be late terminators after a local cancellation.
async fn dispatch(frame: Frame, handle: &Arc<ConnectorHandle>) {
    let Frame { id, payload } = frame;
    match payload {
        Payload::Response(response) => match handle.inflight().remove(&id) {
            Some(ResponseSink::Unary(slot)) => {
                let _ = slot.send(UnaryOutcome::Response(response));
            }
            Some(ResponseSink::Stream(chunks)) => {
                // upstream answered a stream:true request without streaming;
                // deliver the body as a single chunk
                tokio::spawn(async move {
                    if chunks.send(StreamEvent::Chunk(response.body)).await.is_ok() {
                        let _ = chunks.send(StreamEvent::End).await;
                    }
                });
            }
            None => tracing::warn!(%id, "RESPONSE for unknown correlation id"),
        },
        Payload::StreamChunk(chunk) => deliver_chunk(id, chunk, handle).await,
        Payload::StreamEnd { .. } => match handle.inflight().remove(&id) {
            Some(ResponseSink::Stream(chunks)) => {
                tokio::spawn(async move {
                    let _ = chunks.send(StreamEvent::End).await;
                });
            }
            Some(sink @ ResponseSink::Unary(_)) => sink.fail(ErrorPayload {
                status: 502,
                error: "streaming response to a non-streaming request".to_owned(),
                code: ErrorCode::LlmError,
            }),
            None => tracing::warn!(%id, "STREAM_END for unknown correlation id"),
        },
        Payload::Error(error) => match handle.inflight().remove(&id) {
            Some(sink) => sink.fail(error),
            None => tracing::warn!(%id, "ERROR for unknown correlation id"),
        },
        Payload::Ping {} => {
            let _ = handle.send(Frame::new(id, Payload::Pong {})).await;
        }
        Payload::Pong {} => {}
        Payload::Auth(_)
        | Payload::AuthOk { .. }
        | Payload::AuthFail { .. }
        | Payload::Request(_)
        | Payload::Cancel {} => {
            tracing::warn!(%id, "unexpected frame from connector");
        }
    }
}

/// Delivers one stream chunk, enforcing the bounded per-request buffer.
async fn deliver_chunk(id: FrameId, chunk: StreamChunkPayload, handle: &Arc<ConnectorHandle>) {
    ::metrics::counter!(crate::metrics::METRICS_ID_BROKER_STREAM_CHUNKS).increment(1);
    match handle.inflight().stream_sender(&id) {
        Some(sender) => match sender.try_send(StreamEvent::Chunk(chunk.chunk)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                // the external caller stopped reading; the buffer bound keeps
                // the transport from stalling globally
                if let Some(sink) = handle.inflight().remove(&id) {
                    sink.fail(ErrorPayload {
                        status: 503,
                        error: "caller too slow to consume the stream".to_owned(),
                        code: ErrorCode::SlowConsumer,
                    });
                }
                let _ = handle.send(Frame::new(id, Payload::Cancel {})).await;
            }
            Err(TrySendError::Closed(_)) => {
                // the handler is gone; its drop guard has sent the CANCEL
                handle.inflight().remove(&id);
            }
        },
        None if handle.inflight().contains(&id) => {
            if let Some(sink) = handle.inflight().remove(&id) {
                sink.fail(ErrorPayload {
                    status: 502,
                    error: "streaming response to a non-streaming request".to_owned(),
                    code: ErrorCode::LlmError,
                });
            }
            let _ = handle.send(Frame::new(id, Payload::Cancel {})).await;
        }
        None => tracing::warn!(%id, "STREAM_CHUNK for unknown correlation id"),
    }
}

/// Attempts to read the next frame, skipping transport-level ping/pong.
async fn read_frame(socket: &mut WebSocket, limits: &FrameLimits) -> Result<Frame, SessionError> {
    loop {
        match socket.recv().await.ok_or(SessionError::ConnectionClosed)?? {
            ws::Message::Text(text) => return Ok(codec::decode(text.as_str(), limits)?),
            ws::Message::Close(_) => return Err(SessionError::ConnectionClosed),
            ws::Message::Ping(_) | ws::Message::Pong(_) => continue,
            ws::Message::Binary(_) => return Err(SessionError::UnexpectedMessage),
        }
    }
}

/// Sends AUTH_FAIL and closes; used before a session exists.
async fn reject(socket: &mut WebSocket, error: &str) {
    let frame = Frame::bootstrap(Payload::AuthFail {
        error: error.to_owned(),
    });
    let _ = socket.send(ws::Message::text(codec::encode(&frame))).await;
    let _ = socket
        .send(ws::Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: "auth failed".into(),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_types::frame::ResponsePayload;
    use tokio::sync::oneshot;

    fn test_handle() -> (Arc<ConnectorHandle>, mpsc::Receiver<Frame>) {
        ConnectorHandle::new(
            SessionId::fresh(),
            vec!["llama3.2".to_owned()],
            8,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn response_reaches_the_unary_slot() {
        let (handle, _outbound) = test_handle();
        let (tx, rx) = oneshot::channel();
        let id = FrameId::fresh();
        handle.inflight().insert(id.clone(), ResponseSink::Unary(tx));

        let response = ResponsePayload {
            status: 200,
            headers: vec![],
            body: b"{}".to_vec(),
        };
        dispatch(
            Frame::new(id.clone(), Payload::Response(response.clone())),
            &handle,
        )
        .await;

        match rx.await.expect("delivered") {
            UnaryOutcome::Response(got) => assert_eq!(got, response),
            UnaryOutcome::Error(err) => panic!("unexpected error: {err:?}"),
        }
        assert!(!handle.inflight().contains(&id));
    }

    #[tokio::test]
    async fn chunk_overflow_fails_with_slow_consumer_and_cancels() {
        let (handle, mut outbound) = test_handle();
        let (tx, mut rx) = mpsc::channel(1);
        let id = FrameId::fresh();
        handle.inflight().insert(id.clone(), ResponseSink::Stream(tx));

        let chunk = |bytes: &[u8]| {
            Frame::new(
                id.clone(),
                Payload::StreamChunk(StreamChunkPayload::new(bytes.to_vec())),
            )
        };
        dispatch(chunk(b"one"), &handle).await;
        // buffer of one is now full; the next chunk overflows
        dispatch(chunk(b"two"), &handle).await;

        assert!(!handle.inflight().contains(&id));
        match rx.recv().await.expect("first chunk") {
            StreamEvent::Chunk(bytes) => assert_eq!(bytes, b"one"),
            other => panic!("expected chunk, got {other:?}"),
        }
        match rx.recv().await.expect("terminal error") {
            StreamEvent::Error(err) => assert_eq!(err.code, ErrorCode::SlowConsumer),
            other => panic!("expected error, got {other:?}"),
        }
        let cancel = outbound.recv().await.expect("cancel enqueued");
        assert_eq!(cancel.id, id);
        assert!(matches!(cancel.payload, Payload::Cancel {}));
    }

    #[tokio::test]
    async fn unknown_correlation_ids_are_dropped() {
        let (handle, mut outbound) = test_handle();
        dispatch(
            Frame::new(
                FrameId::fresh(),
                Payload::StreamChunk(StreamChunkPayload::new(b"late".to_vec())),
            ),
            &handle,
        )
        .await;
        dispatch(Frame::new(FrameId::fresh(), Payload::stream_end()), &handle).await;

        // nothing was enqueued and nothing panicked
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong_carrying_the_same_id() {
        let (handle, mut outbound) = test_handle();
        let id = FrameId::fresh();
        dispatch(Frame::new(id.clone(), Payload::Ping {}), &handle).await;

        let pong = outbound.recv().await.expect("pong enqueued");
        assert_eq!(pong.id, id);
        assert!(matches!(pong.payload, Payload::Pong {}));
    }
}

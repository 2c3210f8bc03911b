//! The connector side of the duplex session.
//!
//! [`run`] dials the broker, authenticates, and keeps the session alive
//! until the shutdown signal fires, reconnecting with jittered exponential
//! backoff whenever the link drops. Within one authenticated session a
//! reader (this task) dispatches REQUEST/CANCEL/PING frames while a writer
//! task serializes every outbound frame and emits PING after prolonged
//! idleness; a missing PONG declares the session dead.
//!
//! Correlation ids are scoped to a single session: a fresh AUTH_OK starts
//! from an empty request table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use eyre::Context as _;
use futures::stream::SplitSink;
use futures::{SinkExt as _, StreamExt as _};
use parking_lot::Mutex;
use relay_types::codec::{self, CodecError};
use relay_types::error_code::ErrorCode;
use relay_types::frame::{AuthPayload, ErrorPayload, Frame, Payload};
use relay_types::limits::FrameLimits;
use relay_types::{FrameId, RELAY_PROTOCOL_VERSION_HEADER, SessionId};
use secrecy::ExposeSecret as _;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::backoff::ReconnectBackoff;
use crate::config::ConnectorConfig;
use crate::metrics::{
    METRICS_ID_CONNECTOR_RECONNECTS, METRICS_ID_CONNECTOR_REQUESTS_INFLIGHT,
    METRICS_ID_CONNECTOR_REQUESTS_TOTAL,
};
use crate::upstream::{self, UpstreamContext};

type WebSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Errors that end one connector session.
#[derive(Debug, thiserror::Error)]
enum SessionError {
    #[error("invalid broker url: {0}")]
    InvalidUri(#[from] tungstenite::http::uri::InvalidUri),
    #[error(transparent)]
    Ws(#[from] tungstenite::Error),
    #[error(transparent)]
    Decode(#[from] CodecError),
    #[error("broker rejected authentication: {0}")]
    AuthRejected(String),
    #[error("no AUTH_OK within {0:?}")]
    AuthTimeout(Duration),
    #[error("connection closed by broker")]
    ConnectionClosed,
    #[error("unexpected message")]
    UnexpectedMessage,
}

/// In-flight upstream calls of the current session, by correlation id.
#[derive(Default, Clone)]
struct ActiveRequests(Arc<Mutex<HashMap<FrameId, CancellationToken>>>);

impl ActiveRequests {
    fn insert(&self, id: FrameId, cancel: CancellationToken) {
        self.0.lock().insert(id, cancel);
    }

    fn remove(&self, id: &FrameId) -> Option<CancellationToken> {
        self.0.lock().remove(id)
    }

    fn len(&self) -> usize {
        self.0.lock().len()
    }
}

/// Runs the reconnect loop until the shutdown signal fires.
///
/// Each authenticated session is logically fresh; the backoff resets after
/// every successful AUTH_OK.
pub async fn run(config: ConnectorConfig, shutdown: CancellationToken) -> eyre::Result<()> {
    let http = reqwest::Client::builder()
        .build()
        .context("while building the upstream HTTP client")?;
    let mut backoff = ReconnectBackoff::new(config.backoff_base, config.backoff_cap);
    let config = Arc::new(config);

    while !shutdown.is_cancelled() {
        ::metrics::counter!(METRICS_ID_CONNECTOR_RECONNECTS).increment(1);
        match connect_and_serve(&config, &http, &shutdown, &mut backoff).await {
            Ok(()) => tracing::info!("session ended"),
            Err(err) => tracing::warn!("session failed: {err:?}"),
        }
        if shutdown.is_cancelled() {
            break;
        }
        let delay = backoff.next_delay();
        tracing::info!("reconnecting in {delay:?}");
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    tracing::info!("connector stopped");
    Ok(())
}

/// One connection attempt: dial, AUTH handshake, authenticated phase.
#[instrument(level = "debug", skip_all, fields(session_id = tracing::field::Empty))]
async fn connect_and_serve(
    config: &Arc<ConnectorConfig>,
    http: &reqwest::Client,
    shutdown: &CancellationToken,
    backoff: &mut ReconnectBackoff,
) -> Result<(), SessionError> {
    let endpoint: tungstenite::http::Uri = config.broker_url.parse()?;
    let version = env!("CARGO_PKG_VERSION");
    tracing::debug!("> dialing {endpoint}..");
    let request = ClientRequestBuilder::new(endpoint)
        .with_header(RELAY_PROTOCOL_VERSION_HEADER.as_str(), version);
    let (mut ws, _) = tokio_tungstenite::connect_async(request).await?;

    let auth = Frame::bootstrap(Payload::Auth(AuthPayload {
        token: config.token.expose_secret().to_owned(),
        connector_version: version.to_owned(),
        models: config.models.clone(),
    }));
    ws.send(tungstenite::Message::text(codec::encode(&auth)))
        .await?;

    let limits = config.frame_limits();
    let session_id = tokio::time::timeout(config.auth_timeout, read_auth_ok(&mut ws, &limits))
        .await
        .map_err(|_| SessionError::AuthTimeout(config.auth_timeout))??;
    backoff.reset();
    tracing::Span::current().record("session_id", session_id.to_string());
    tracing::info!(%session_id, models = ?config.models, "authenticated to broker");

    serve_session(ws, config, http, shutdown, limits).await
}

/// Reads frames until AUTH_OK or AUTH_FAIL arrives.
async fn read_auth_ok(ws: &mut WebSocket, limits: &FrameLimits) -> Result<SessionId, SessionError> {
    loop {
        match ws.next().await.ok_or(SessionError::ConnectionClosed)?? {
            tungstenite::Message::Text(text) => {
                let frame = codec::decode(text.as_str(), limits)?;
                return match frame.payload {
                    Payload::AuthOk { session_id } => Ok(session_id),
                    Payload::AuthFail { error } => Err(SessionError::AuthRejected(error)),
                    _ => Err(SessionError::UnexpectedMessage),
                };
            }
            tungstenite::Message::Close(_) => return Err(SessionError::ConnectionClosed),
            tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => continue,
            _ => return Err(SessionError::UnexpectedMessage),
        }
    }
}

/// The authenticated phase: writer task plus reader loop.
///
/// On shutdown the reader stops accepting new REQUEST frames and lets the
/// in-flight upstream calls finish within the drain deadline before the
/// best-effort close.
async fn serve_session(
    ws: WebSocket,
    config: &Arc<ConnectorConfig>,
    http: &reqwest::Client,
    shutdown: &CancellationToken,
    limits: FrameLimits,
) -> Result<(), SessionError> {
    let (sink, mut stream) = ws.split();
    let session_cancel = CancellationToken::new();
    let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue);
    let (pong_tx, pong_rx) = watch::channel(Instant::now());

    let ctx = Arc::new(UpstreamContext {
        http: http.clone(),
        base_url: config.upstream_url.clone(),
        timeout: config.upstream_timeout,
        limits,
        outbound: outbound_tx.clone(),
    });
    let active = ActiveRequests::default();

    let writer = tokio::spawn(write_loop(
        sink,
        outbound_rx,
        session_cancel.clone(),
        config.heartbeat_interval,
        pong_rx,
    ));

    let mut draining = false;
    let mut drain_deadline = Instant::now();
    let result = loop {
        if draining && (active.len() == 0 || Instant::now() >= drain_deadline) {
            break Ok(());
        }
        tokio::select! {
            _ = session_cancel.cancelled() => break Ok(()),
            _ = shutdown.cancelled(), if !draining => {
                draining = true;
                drain_deadline = Instant::now() + config.drain_timeout;
                tracing::info!("draining {} in-flight requests", active.len());
            }
            _ = tokio::time::sleep(Duration::from_millis(100)), if draining => {}
            msg = stream.next() => {
                let frame = match msg {
                    None => break Ok(()),
                    Some(Err(err)) => break Err(SessionError::from(err)),
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        match codec::decode(text.as_str(), &limits) {
                            Ok(frame) => frame,
                            // decode failure on an authenticated session is fatal
                            Err(err) => break Err(SessionError::from(err)),
                        }
                    }
                    Some(Ok(tungstenite::Message::Close(_))) => break Ok(()),
                    Some(Ok(tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_))) => {
                        continue;
                    }
                    Some(Ok(_)) => break Err(SessionError::UnexpectedMessage),
                };
                dispatch(frame, draining, &active, &ctx, &outbound_tx, &pong_tx, &session_cancel)
                    .await;
            }
        }
    };

    // cancelling the session stops the writer and aborts every upstream
    // call through its child token
    session_cancel.cancel();
    let _ = writer.await;
    result
}

/// Routes one inbound frame.
async fn dispatch(
    frame: Frame,
    draining: bool,
    active: &ActiveRequests,
    ctx: &Arc<UpstreamContext>,
    outbound: &mpsc::Sender<Frame>,
    pong_tx: &watch::Sender<Instant>,
    session_cancel: &CancellationToken,
) {
    let Frame { id, payload } = frame;
    match payload {
        Payload::Request(request) => {
            if draining {
                // refuse instead of silently dropping so the broker can
                // fail the caller right away
                let _ = outbound
                    .send(Frame::new(
                        id,
                        Payload::Error(ErrorPayload {
                            status: 503,
                            error: "connector shutting down".to_owned(),
                            code: ErrorCode::Shutdown,
                        }),
                    ))
                    .await;
                return;
            }
            ::metrics::counter!(METRICS_ID_CONNECTOR_REQUESTS_TOTAL).increment(1);
            tracing::debug!(%id, method = %request.method, path = %request.path, "relaying to upstream");
            let cancel = session_cancel.child_token();
            active.insert(id.clone(), cancel.clone());
            ::metrics::gauge!(METRICS_ID_CONNECTOR_REQUESTS_INFLIGHT).increment(1);
            tokio::spawn({
                let ctx = Arc::clone(ctx);
                let active = active.clone();
                async move {
                    upstream::handle_request(ctx, id.clone(), request, cancel).await;
                    active.remove(&id);
                    ::metrics::gauge!(METRICS_ID_CONNECTOR_REQUESTS_INFLIGHT).decrement(1);
                }
            });
        }
        Payload::Cancel {} => {
            if let Some(cancel) = active.remove(&id) {
                tracing::debug!(%id, "cancelling upstream call");
                cancel.cancel();
            }
        }
        Payload::Ping {} => {
            let _ = outbound.send(Frame::new(id, Payload::Pong {})).await;
        }
        Payload::Pong {} => {
            let _ = pong_tx.send(Instant::now());
        }
        Payload::Auth(_)
        | Payload::AuthOk { .. }
        | Payload::AuthFail { .. }
        | Payload::Response(_)
        | Payload::StreamChunk(_)
        | Payload::StreamEnd { .. }
        | Payload::Error(_) => {
            tracing::warn!(%id, "unexpected frame from broker");
        }
    }
}

/// Serializes outbound frames and keeps the heartbeat.
///
/// The writer is the only producer of bytes on the transport. PING goes out
/// after a full heartbeat interval without writes; if no PONG arrived by the
/// next tick the session is declared dead.
async fn write_loop(
    mut sink: SplitSink<WebSocket, tungstenite::Message>,
    mut outbound_rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
    heartbeat: Duration,
    pong_rx: watch::Receiver<Instant>,
) {
    let mut idle = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
    idle.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut awaiting_pong: Option<Instant> = None;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = outbound_rx.recv() => match frame {
                Some(frame) => {
                    if sink
                        .send(tungstenite::Message::text(codec::encode(&frame)))
                        .await
                        .is_err()
                    {
                        cancel.cancel();
                        break;
                    }
                    idle.reset();
                }
                None => break,
            },
            _ = idle.tick() => {
                if let Some(sent) = awaiting_pong
                    && *pong_rx.borrow() < sent
                {
                    tracing::warn!("no PONG since last PING; declaring session dead");
                    cancel.cancel();
                    break;
                }
                let ping = Frame::new(FrameId::fresh(), Payload::Ping {});
                if sink
                    .send(tungstenite::Message::text(codec::encode(&ping)))
                    .await
                    .is_err()
                {
                    cancel.cancel();
                    break;
                }
                awaiting_pong = Some(Instant::now());
            }
        }
    }
    // closing handshake on a best-effort basis
    let _ = sink
        .send(tungstenite::Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "session over".into(),
        })))
        .await;
}

//! Test harness: a real broker on ephemeral listeners plus a scripted
//! connector speaking the duplex protocol over tokio-tungstenite.

use std::net::SocketAddr;

use clap::Parser as _;
use eyre::Context as _;
use futures::{SinkExt as _, StreamExt as _};
use relay_broker::Broker;
use relay_broker::config::BrokerConfig;
use relay_types::codec;
use relay_types::frame::{AuthPayload, Frame, Payload, RequestPayload};
use relay_types::limits::FrameLimits;
use relay_types::{FrameId, RELAY_PROTOCOL_VERSION_HEADER, SessionId};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

pub struct TestBroker {
    pub api_addr: SocketAddr,
    pub ws_addr: SocketAddr,
    pub health_addr: SocketAddr,
    pub shutdown: CancellationToken,
}

impl TestBroker {
    /// Broker with tokens `t1` (credential `sk-upstream`) and `t2` (none),
    /// user key `sk-user`, and a short request deadline.
    pub async fn start() -> eyre::Result<Self> {
        Self::start_with_deadline("5s").await
    }

    pub async fn start_with_deadline(deadline: &str) -> eyre::Result<Self> {
        let config = BrokerConfig::parse_from([
            "relay-broker",
            "--connector-token",
            "t1:sk-upstream",
            "--connector-token",
            "t2",
            "--user-key",
            "sk-user",
            "--request-deadline",
            deadline,
            "--drain-timeout",
            "1s",
        ]);
        let shutdown = CancellationToken::new();
        let broker = Broker::init(config);

        let api_addr = serve(broker.api_router(), &shutdown).await?;
        let ws_addr = serve(broker.connector_router(), &shutdown).await?;
        let health_addr = serve(broker.health_router(), &shutdown).await?;

        Ok(Self {
            api_addr,
            ws_addr,
            health_addr,
            shutdown,
        })
    }

    pub fn api_url(&self, path: &str) -> String {
        format!("http://{}{path}", self.api_addr)
    }

    pub fn health_url(&self) -> String {
        format!("http://{}/health", self.health_addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.ws_addr)
    }

    /// Polls `/health` until the expected number of connectors is reported.
    pub async fn wait_for_connectors(&self, expected: u64) -> eyre::Result<()> {
        for _ in 0..100 {
            let health = reqwest::get(self.health_url())
                .await?
                .json::<serde_json::Value>()
                .await?;
            if health["connectors_connected"] == serde_json::json!(expected) {
                return Ok(());
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        eyre::bail!("never reached {expected} connected connectors")
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve(router: axum::Router, shutdown: &CancellationToken) -> eyre::Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .context("while binding a test listener")?;
    let addr = listener.local_addr()?;
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
    });
    Ok(addr)
}

pub struct TestConnector {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pub session_id: SessionId,
}

impl std::fmt::Debug for TestConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestConnector")
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl TestConnector {
    /// Connects, authenticates, and returns after AUTH_OK.
    pub async fn connect(
        broker: &TestBroker,
        token: &str,
        models: &[&str],
    ) -> eyre::Result<Self> {
        let request = ClientRequestBuilder::new(broker.ws_url().parse()?)
            .with_header(RELAY_PROTOCOL_VERSION_HEADER.as_str(), env!("CARGO_PKG_VERSION"));
        let (mut ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .context("while dialing the broker")?;

        let auth = Frame::bootstrap(Payload::Auth(AuthPayload {
            token: token.to_owned(),
            connector_version: env!("CARGO_PKG_VERSION").to_owned(),
            models: models.iter().map(|m| (*m).to_owned()).collect(),
        }));
        ws.send(tungstenite::Message::text(codec::encode(&auth)))
            .await?;

        let reply = loop {
            match ws
                .next()
                .await
                .ok_or_else(|| eyre::eyre!("connection closed"))??
            {
                tungstenite::Message::Text(text) => {
                    break codec::decode(text.as_str(), &FrameLimits::default())?;
                }
                tungstenite::Message::Close(frame) => {
                    eyre::bail!("broker closed the session: {frame:?}")
                }
                _ => continue,
            }
        };
        match reply.payload {
            Payload::AuthOk { session_id } => Ok(Self { ws, session_id }),
            Payload::AuthFail { error } => eyre::bail!("auth rejected: {error}"),
            other => eyre::bail!("unexpected frame: {other:?}"),
        }
    }

    pub async fn send(&mut self, frame: Frame) -> eyre::Result<()> {
        self.ws
            .send(tungstenite::Message::text(codec::encode(&frame)))
            .await?;
        Ok(())
    }

    /// Next protocol frame; transport ping/pong is skipped.
    pub async fn recv(&mut self) -> eyre::Result<Frame> {
        loop {
            match self
                .ws
                .next()
                .await
                .ok_or_else(|| eyre::eyre!("connection closed"))??
            {
                tungstenite::Message::Text(text) => {
                    return Ok(codec::decode(text.as_str(), &FrameLimits::default())?);
                }
                tungstenite::Message::Close(frame) => {
                    eyre::bail!("broker closed the session: {frame:?}")
                }
                _ => continue,
            }
        }
    }

    /// Awaits the next REQUEST frame.
    pub async fn expect_request(&mut self) -> eyre::Result<(FrameId, RequestPayload)> {
        let frame = self.recv().await?;
        match frame.payload {
            Payload::Request(request) => Ok((frame.id, request)),
            other => eyre::bail!("expected REQUEST, got {other:?}"),
        }
    }

    /// Drops the transport without a closing handshake.
    pub fn kill(self) {
        drop(self.ws);
    }
}

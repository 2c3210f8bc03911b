#![deny(missing_docs)]
//! The publicly reachable half of the relay.
//!
//! The broker accepts external OpenAI-compatible HTTP callers on one
//! listener, connector duplex sessions on a second, and serves its health
//! snapshot on a third. Requests are multiplexed onto the connector session
//! that owns the requested model and streamed back without ever buffering a
//! full response body.
//!
//! The main entry point is [`Broker::init`], which wires the shared services
//! (router, registry) into three `axum::Router`s. The hosting binary binds
//! the listeners and serves the routers; on its stop signal it stops
//! accepting new work and awaits [`Broker::drain`] so in-flight requests
//! either finish within the drain deadline or are failed with a `shutdown`
//! error, after which the connector sessions are closed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use relay_types::error_code::ErrorCode;
use relay_types::frame::ErrorPayload;
use tokio::time::Instant;
use tower_http::trace::TraceLayer;

use crate::api::connector::ConnectorEndpoint;
use crate::api::openai::OpenAiApi;
use crate::config::BrokerConfig;
use crate::metrics::{METRICS_ID_BROKER_CONNECTORS, METRICS_ID_BROKER_REQUESTS_INFLIGHT};
use crate::services::registry::ConnectorRegistry;
use crate::services::router::ModelRouter;

pub(crate) mod api;
pub mod config;
pub mod metrics;
pub(crate) mod services;

/// The assembled broker: three routers over shared relay state.
pub struct Broker {
    api: Router,
    connector: Router,
    health: Router,
    registry: ConnectorRegistry,
    drain_timeout: Duration,
}

impl Broker {
    /// Wires the broker services and routers from the configuration.
    pub fn init(config: BrokerConfig) -> Self {
        ::metrics::gauge!(METRICS_ID_BROKER_CONNECTORS).set(0);
        ::metrics::gauge!(METRICS_ID_BROKER_REQUESTS_INFLIGHT).set(0);

        let registry = ConnectorRegistry::default();
        let router = ModelRouter::default();
        let tokens = config
            .connector_tokens
            .iter()
            .map(|spec| (spec.token.clone(), spec.credential.clone()))
            .collect::<HashMap<_, _>>();

        let api = api::openai::routes(OpenAiApi {
            router: router.clone(),
            registry: registry.clone(),
            user_keys: Arc::new(config.user_keys.clone()),
            request_deadline: config.request_deadline,
            limits: config.frame_limits(),
            chunk_buffer: config.chunk_buffer,
        })
        .layer(TraceLayer::new_for_http());

        let connector = api::connector::routes(ConnectorEndpoint {
            registry: registry.clone(),
            router: router.clone(),
            tokens: Arc::new(tokens),
            limits: config.frame_limits(),
            auth_timeout: config.auth_timeout,
            ws_max_message_size: config.ws_max_message_size,
            outbound_queue: config.outbound_queue,
            version_req: config.accepted_versions.clone(),
        })
        .layer(TraceLayer::new_for_http());

        let health = api::health::routes(registry.clone(), router);

        Self {
            api,
            connector,
            health,
            registry,
            drain_timeout: config.drain_timeout,
        }
    }

    /// The external OpenAI-compatible router.
    pub fn api_router(&self) -> Router {
        self.api.clone()
    }

    /// The connector duplex router.
    pub fn connector_router(&self) -> Router {
        self.connector.clone()
    }

    /// The health router.
    pub fn health_router(&self) -> Router {
        self.health.clone()
    }

    /// Lets in-flight requests finish within the drain deadline, fails the
    /// remainder with `shutdown`, and closes every connector session.
    ///
    /// Call after the stop signal and before awaiting the serve tasks, so
    /// long-lived streaming responses and duplex sessions are released.
    pub async fn drain(&self) {
        let deadline = Instant::now() + self.drain_timeout;
        while self.registry.inflight_total() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let remaining = self.registry.inflight_total();
        if remaining > 0 {
            tracing::warn!(remaining, "forcibly failing in-flight requests");
        }
        self.registry.fail_all_inflight(&ErrorPayload {
            status: 503,
            error: "broker shutting down".to_owned(),
            code: ErrorCode::Shutdown,
        });
        for handle in self.registry.handles() {
            handle.cancel_token().cancel();
        }
    }
}

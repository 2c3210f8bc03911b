//! Health endpoint
//!
//! Publishes the status snapshot the core maintains anyway: how many
//! connector sessions are live and which models are currently routable.
//!
//! - `/health` – returns the snapshot as JSON
//! - `/version` – returns the crate version string
//!
//! The endpoints include a `Cache-Control: no-cache` header to prevent
//! caching of responses.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tower_http::set_header::SetResponseHeaderLayer;

use crate::services::registry::ConnectorRegistry;
use crate::services::router::ModelRouter;

/// Create a router containing the health endpoints.
///
/// All endpoints have `Cache-Control: no-cache` set.
pub(crate) fn routes(registry: ConnectorRegistry, router: ModelRouter) -> Router {
    Router::new()
        .route(
            "/health",
            get(move || health(registry.clone(), router.clone())),
        )
        .route("/version", get(version))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        ))
}

/// Responds with the broker status snapshot.
///
/// Returns `200 OK` with a JSON body.
async fn health(registry: ConnectorRegistry, router: ModelRouter) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "connectors_connected": registry.len(),
            "models": router.models(),
        })),
    )
}

/// Responds with cargo package name and version.
///
/// Returns `200 OK` with a string response.
async fn version() -> impl IntoResponse {
    (
        StatusCode::OK,
        concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION")),
    )
}

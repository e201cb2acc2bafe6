//! HTTP entry point of the service.
//!
//! This module wires the shared [`AppState`] into an axum [`Router`]:
//!
//! - `POST /v1/stream`, `POST /sse/stream` - chunked SSE streams, behind
//!   admission control.
//! - `GET /ws/stream` - WebSocket sessions; every inbound message is admitted
//!   individually, so the upgrade itself is not rate limited.
//! - `GET /v1/healthz` - liveness plus the limiter's store mode.
//!
//! Every response carries an `x-request-id`, echoed from the request when
//! present and generated otherwise.

use crate::server::{
    config::ServerConfig,
    service::admission::admit,
    streaming::{
        registry::StreamRegistry, session::ConnectionTracker, sse::sse_stream, ws::ws_stream,
    },
};
use axum::{
    Json, Router,
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{Extensions, HeaderMap, HeaderValue, StatusCode, request::Parts},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use core::convert::Infallible;
use factgate::{FactPipeline, Identity, StoreMode, TokenBucketLimiter};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Identity used for any dimension the request does not carry.
pub const ANONYMOUS: &str = "anon";

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub limiter: Arc<TokenBucketLimiter>,
    pub pipeline: Arc<dyn FactPipeline>,
    pub registry: Arc<StreamRegistry>,
    pub connections: Arc<ConnectionTracker>,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        limiter: Arc<TokenBucketLimiter>,
        pipeline: Arc<dyn FactPipeline>,
    ) -> Self {
        let registry = Arc::new(StreamRegistry::new(config.shutdown_timeout));
        Self {
            config: Arc::new(config),
            limiter,
            pipeline,
            registry,
            connections: Arc::new(ConnectionTracker::default()),
        }
    }

    /// The rate-limit identity of a caller. Missing headers map to
    /// [`ANONYMOUS`].
    pub fn identity(&self, headers: &HeaderMap, ip: &str) -> Identity {
        Identity::new(
            header_value(headers, &self.config.api_key_header).unwrap_or(ANONYMOUS),
            ip,
            header_value(headers, &self.config.org_header).unwrap_or(ANONYMOUS),
        )
    }
}

/// Builds the service router.
pub fn router(state: AppState) -> Router {
    let limited = Router::new()
        .route("/v1/stream", post(sse_stream))
        .route("/sse/stream", post(sse_stream))
        .route_layer(middleware::from_fn_with_state(state.clone(), admit));

    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/ws/stream", get(ws_stream))
        .merge(limited)
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn(request_id))
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
        .with_state(state)
}

/// Non-empty, trimmed value of header `name`.
pub fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Peer address of the connection, or [`ANONYMOUS`] when the server was not
/// started with connect info.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(client_ip(&parts.extensions)))
    }
}

pub fn client_ip(extensions: &Extensions) -> String {
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| ANONYMOUS.to_owned(), |ConnectInfo(addr)| addr.ip().to_string())
}

/// Correlation id of the current request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn of(extensions: &Extensions) -> String {
        extensions
            .get::<Self>()
            .map_or_else(String::new, |id| id.0.clone())
    }
}

impl<S: Send + Sync> FromRequestParts<S> for RequestId {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(Self::of(&parts.extensions)))
    }
}

async fn request_id(mut request: Request, next: Next) -> Response {
    let id = header_value(request.headers(), REQUEST_ID_HEADER)
        .filter(|v| v.len() <= 128)
        .map_or_else(generate_request_id, str::to_owned);
    request.extensions_mut().insert(RequestId(id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

fn generate_request_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

async fn healthz(State(state): State<AppState>) -> Response {
    let failover = state.limiter.failover_state();
    let mode = state.limiter.mode();
    let backend = match mode {
        StoreMode::Primary => state
            .limiter
            .remote_factory()
            .and_then(|f| f.active_backend())
            .unwrap_or("unconnected"),
        StoreMode::Fallback | StoreMode::Local => "memory",
    };

    let (code, status) = if state.registry.is_shutting_down() {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting_down")
    } else if mode == StoreMode::Fallback {
        (StatusCode::OK, "degraded")
    } else {
        (StatusCode::OK, "ok")
    };

    let body = json!({
        "status": status,
        "store": {
            "backend": backend,
            "mode": mode.as_str(),
            "fallback_until": failover.fallback_until.filter(|_| mode == StoreMode::Fallback),
        },
    });
    (code, Json(body)).into_response()
}

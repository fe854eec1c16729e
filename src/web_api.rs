//! HTTP serving surface
//!
//! ## Endpoints
//!
//! - `POST /moderation` - moderate one message (unary or streaming)
//! - `GET /moderation` - rolling service metrics + cache stats
//! - `GET /model-router/stats` - router usage, performance, cost report
//! - `GET /health` - liveness check
//! - `GET /metrics` - Prometheus exposition
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use llm_substrate::web_api::{start_server, AppState, ServerConfig};
//! # async fn example(state: Arc<AppState>) {
//! start_server(ServerConfig::default(), state).await.unwrap();
//! # }
//! ```

use crate::moderation::{ModerationRequest, ModerationService, ServeOutcome, StreamServe};
use crate::rate_limit::{derive_client_id, RateLimitDecision};
use crate::routing::{RouterStatsReport, StatsProjector};
use crate::telemetry::TelemetryStore;
use crate::SubstrateError;
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::info;

/// Configuration for the HTTP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Shared handler state.
pub struct AppState {
    /// The moderation serving path.
    pub service: Arc<ModerationService>,
    /// Telemetry backing the stats endpoint.
    pub telemetry: Arc<TelemetryStore>,
    /// Projection settings for the stats endpoint.
    pub projector: StatsProjector,
}

/// JSON body for `POST /moderation`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModerationBody {
    /// The message to moderate. Required.
    #[serde(default)]
    pub message: Option<String>,
    /// Optional locale hint.
    #[serde(default)]
    pub locale: Option<String>,
    /// Request an incremental `text/plain` response.
    #[serde(default)]
    pub stream: bool,
}

/// JSON body for 4xx/5xx responses.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none", rename = "retryAfter")]
    retry_after: Option<u64>,
}

enum AppError {
    BadRequest(String),
    Config(String),
    Internal(String),
}

impl From<SubstrateError> for AppError {
    fn from(e: SubstrateError) -> Self {
        match e {
            SubstrateError::Input(msg) => Self::BadRequest(msg),
            SubstrateError::Config(msg) => Self::Config(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, "bad_request", m),
            Self::Config(m) => (StatusCode::SERVICE_UNAVAILABLE, "no_eligible_backend", m),
            Self::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", m),
        };
        (
            status,
            Json(ErrorBody {
                error,
                message,
                retry_after: None,
            }),
        )
            .into_response()
    }
}

/// Build the application router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/moderation", post(post_moderation).get(get_moderation))
        .route("/model-router/stats", get(get_router_stats))
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server and serve until the process exits.
pub async fn start_server(
    config: ServerConfig,
    state: Arc<AppState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = format!("{}:{}", config.host, config.port);
    info!(addr = %addr, "starting moderation API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

fn client_id_from(headers: &HeaderMap, peer: Option<&SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok());
    let real_ip = headers.get("x-real-ip").and_then(|v| v.to_str().ok());
    let peer = peer.map(|p| p.ip().to_string());
    derive_client_id(forwarded, real_ip, peer.as_deref())
}

fn rate_limited_response(decision: &RateLimitDecision) -> Response {
    let retry_after = decision.retry_after_secs();
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(ErrorBody {
            error: "rate_limited",
            message: "request budget exhausted for this window".into(),
            retry_after: Some(retry_after),
        }),
    )
        .into_response();

    let headers = response.headers_mut();
    headers.insert("Retry-After", retry_after.into());
    headers.insert("X-RateLimit-Limit", decision.limit.into());
    headers.insert("X-RateLimit-Remaining", decision.remaining.into());
    headers.insert("X-RateLimit-Reset", decision.reset_at_ms.into());
    response
}

async fn post_moderation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    Json(body): Json<ModerationBody>,
) -> Result<Response, AppError> {
    let Some(message) = body.message.filter(|m| !m.trim().is_empty()) else {
        return Err(AppError::BadRequest("field 'message' is required".into()));
    };

    let request = ModerationRequest {
        message,
        locale: body.locale,
        client_id: client_id_from(&headers, peer.as_ref().map(|c| &c.0)),
    };

    if body.stream {
        return match state.service.stream(&request).await? {
            StreamServe::RateLimited(decision) => Ok(rate_limited_response(&decision)),
            StreamServe::Streaming(stream) => {
                let body = Body::from_stream(
                    ReceiverStream::new(stream.deltas).map(Ok::<_, std::convert::Infallible>),
                );
                Ok((
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                    body,
                )
                    .into_response())
            }
        };
    }

    match state.service.handle(&request).await? {
        ServeOutcome::RateLimited(decision) => Ok(rate_limited_response(&decision)),
        ServeOutcome::Completed(outcome) => {
            let (metrics, _) = state.service.metrics();
            let mut payload = serde_json::to_value(&outcome.result)
                .map_err(|e| AppError::Internal(e.to_string()))?;
            if let Some(obj) = payload.as_object_mut() {
                obj.insert("cached".into(), outcome.cached.into());
                obj.insert(
                    "metrics".into(),
                    serde_json::to_value(&metrics)
                        .map_err(|e| AppError::Internal(e.to_string()))?,
                );
            }
            Ok(Json(payload).into_response())
        }
    }
}

async fn get_moderation(State(state): State<Arc<AppState>>) -> Response {
    let (metrics, cache) = state.service.metrics();
    Json(serde_json::json!({
        "metrics": metrics,
        "cache": { "type": cache.backend, "size": cache.entries },
    }))
    .into_response()
}

async fn get_router_stats(State(state): State<Arc<AppState>>) -> Json<RouterStatsReport> {
    Json(state.projector.project(&state.telemetry.snapshot()))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn prometheus_metrics() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        crate::metrics::gather_metrics(),
    )
        .into_response()
}

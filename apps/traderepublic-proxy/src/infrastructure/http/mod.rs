//! HTTP Surface
//!
//! One axum router for everything the proxy serves.
//!
//! # Endpoints
//!
//! - `GET /` - Tunnel WebSocket upgrade
//! - `GET /instruments?q=<text>` - Quotes for a search query
//! - `GET /instruments/{isin}` - Quote for one instrument
//! - `GET /health` - JSON health status
//! - `GET /healthz` - Liveness check
//! - `GET /readyz` - Readiness check
//! - `GET /metrics` - Prometheus metrics in text format
//!
//! Errors are JSON bodies of the form `{"name", "message", "status"}`.
//! Every route allows any origin.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::application::ports::{QuoteError, QuotePort};
use crate::domain::instrument::{InstrumentQuote, Isin};
use crate::infrastructure::metrics::{self, get_metrics_handle};
use crate::infrastructure::tunnel::TunnelGateway;

// =============================================================================
// Errors
// =============================================================================

/// HTTP server errors.
#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
    /// Failed to bind to the configured address.
    #[error("failed to bind HTTP server to {0}: {1}")]
    BindFailed(String, String),

    /// HTTP server encountered a fatal error while running.
    #[error("HTTP server failed: {0}")]
    ServerFailed(String),
}

/// Error returned by a route, rendered as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiError {
    /// Error class, e.g. `BadRequestError`.
    pub name: String,
    /// Human-readable message.
    pub message: String,
    /// HTTP status code.
    pub status: u16,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        let name = match status {
            StatusCode::BAD_REQUEST => "BadRequestError",
            StatusCode::NOT_FOUND => "NotFoundError",
            StatusCode::BAD_GATEWAY => "BadGatewayError",
            StatusCode::GATEWAY_TIMEOUT => "GatewayTimeoutError",
            _ => "InternalServerError",
        };
        Self {
            name: name.to_string(),
            message: message.into(),
            status: status.as_u16(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn timeout(after: Duration) -> Self {
        Self::new(
            StatusCode::GATEWAY_TIMEOUT,
            format!("upstream did not answer within {}s", after.as_secs()),
        )
    }
}

impl From<QuoteError> for ApiError {
    fn from(error: QuoteError) -> Self {
        let status = match &error {
            QuoteError::Invalid(_) => StatusCode::BAD_REQUEST,
            QuoteError::NoExchange(_) => StatusCode::NOT_FOUND,
            QuoteError::NoPayload { .. } | QuoteError::Payload { .. } => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

// =============================================================================
// State
// =============================================================================

/// Shared state for all routes.
#[derive(Clone)]
pub struct AppState {
    quotes: Arc<dyn QuotePort>,
    gateway: TunnelGateway,
    request_timeout: Duration,
    version: &'static str,
    started_at: Instant,
    shutdown: CancellationToken,
}

impl AppState {
    /// Create route state.
    #[must_use]
    pub fn new(
        quotes: Arc<dyn QuotePort>,
        gateway: TunnelGateway,
        request_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            quotes,
            gateway,
            request_timeout,
            version: env!("CARGO_PKG_VERSION"),
            started_at: Instant::now(),
            shutdown,
        }
    }
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(tunnel_handler))
        .route("/instruments", get(search_handler))
        .route("/instruments/{isin}", get(instrument_handler))
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .layer(cors())
        .with_state(state)
}

// =============================================================================
// Server
// =============================================================================

/// HTTP server.
pub struct HttpServer {
    addr: String,
    state: AppState,
    cancel: CancellationToken,
}

impl HttpServer {
    /// Create a new server bound to `addr` once run.
    #[must_use]
    pub const fn new(addr: String, state: AppState, cancel: CancellationToken) -> Self {
        Self {
            addr,
            state,
            cancel,
        }
    }

    /// Run the server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HttpServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HttpServerError> {
        let listener = TcpListener::bind(&self.addr)
            .await
            .map_err(|e| HttpServerError::BindFailed(self.addr.clone(), e.to_string()))?;

        self.serve(listener).await
    }

    /// Serve on an already bound listener until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HttpServerError` if the HTTP server fails while running.
    pub async fn serve(self, listener: TcpListener) -> Result<(), HttpServerError> {
        let addr = listener
            .local_addr()
            .map_or_else(|_| self.addr.clone(), |addr| addr.to_string());
        tracing::info!(%addr, "HTTP server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HttpServerError::ServerFailed(e.to_string()))?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

// =============================================================================
// Middleware
// =============================================================================

fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::CONTENT_LENGTH,
        ])
}

// =============================================================================
// Handlers
// =============================================================================

async fn tunnel_handler(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    let gateway = state.gateway;
    upgrade.on_upgrade(move |socket| async move { gateway.run(socket).await })
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    q: Option<String>,
}

async fn search_handler(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<InstrumentQuote>>, ApiError> {
    let started = Instant::now();
    let query = params
        .q
        .filter(|q| !q.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing query parameter 'q'"))?;

    let result = with_timeout(state.request_timeout, state.quotes.search_quotes(&query)).await;
    record("/instruments", &result, started);
    result.map(Json)
}

async fn instrument_handler(
    State(state): State<AppState>,
    Path(isin): Path<String>,
) -> Result<Json<InstrumentQuote>, ApiError> {
    let started = Instant::now();
    let isin: Isin = isin
        .parse()
        .map_err(|e: crate::domain::instrument::InstrumentError| {
            ApiError::bad_request(e.to_string())
        })?;

    let result = with_timeout(state.request_timeout, state.quotes.instrument_quote(&isin)).await;
    record("/instruments/{isin}", &result, started);
    result.map(Json)
}

async fn with_timeout<T, F>(timeout: Duration, future: F) -> Result<T, ApiError>
where
    F: std::future::Future<Output = Result<T, QuoteError>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(_) => {
            tracing::warn!(timeout_secs = timeout.as_secs(), "Upstream request timed out");
            Err(ApiError::timeout(timeout))
        }
    }
}

fn record<T>(route: &'static str, result: &Result<T, ApiError>, started: Instant) {
    let status = match result {
        Ok(_) => StatusCode::OK.as_u16(),
        Err(e) => e.status,
    };
    metrics::record_http_request(route, status, started.elapsed());
}

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `healthy` while the process serves requests.
    pub status: &'static str,
    /// Proxy version.
    pub version: &'static str,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Whether the upstream connection is open. The connection is opened on
    /// demand, so `false` is normal when idle.
    pub upstream_connected: bool,
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: state.version,
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        upstream_connected: state.quotes.is_connected(),
    })
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<AppState>) -> impl IntoResponse {
    if state.shutdown.is_cancelled() {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    } else {
        (StatusCode::OK, "READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

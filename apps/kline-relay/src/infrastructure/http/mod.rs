//! HTTP Surface
//!
//! Method endpoint, live event stream, health probes and Prometheus metrics
//! on a single axum server.
//!
//! # Endpoints
//!
//! - `POST /rpc/get_kline_histories` - Historical range query (JSON)
//! - `GET /stream/{symbol}` - Server-sent `on_kline` events for one symbol
//! - `GET /health` - JSON health status
//! - `GET /healthz` - Kubernetes liveness probe (simple OK)
//! - `GET /readyz` - Kubernetes readiness probe (streaming running)
//! - `GET /metrics` - Prometheus metrics in text format
//!
//! # Error Bodies
//!
//! Failed method calls answer `{"error": {"kind": ..., "message": ...}}`
//! where `kind` is the stable label of the underlying error.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span};
use uuid::Uuid;

use crate::application::services::{ServiceError, StreamingService};
use crate::domain::pagination::HistoryQuery;
use crate::domain::{Bar, MarketError, Symbol, Timeframe};
use crate::infrastructure::broadcast::SharedTopicHub;
use crate::infrastructure::metrics::{self, get_metrics_handle};

/// Header carrying the per-request id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

// =============================================================================
// Request / Response Types
// =============================================================================

/// Body of `POST /rpc/get_kline_histories`.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryRequest {
    /// Dotted symbol, e.g. `SHFE.cu2401`.
    pub symbol: String,
    /// Inclusive lower bound, UTC ms.
    #[serde(default)]
    pub from_ts: Option<i64>,
    /// Inclusive upper bound, UTC ms.
    #[serde(default)]
    pub to_ts: Option<i64>,
    /// Number of most recent bars.
    #[serde(default)]
    pub limit: Option<usize>,
    /// Granularity in minutes (default 1).
    #[serde(default)]
    pub timeframe: Option<u32>,
}

impl HistoryRequest {
    fn query(&self) -> Result<HistoryQuery, MarketError> {
        let timeframe = self
            .timeframe
            .map_or(Ok(Timeframe::M1), Timeframe::try_from)?;
        Ok(HistoryQuery {
            from_ts: self.from_ts,
            to_ts: self.to_ts,
            limit: self.limit,
            timeframe,
        })
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    kind: &'static str,
    message: String,
}

/// Service error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self(err)
    }
}

impl From<MarketError> for ApiError {
    fn from(err: MarketError) -> Self {
        Self(ServiceError::Market(err))
    }
}

/// HTTP status for a service error.
#[must_use]
pub const fn status_for(err: &ServiceError) -> StatusCode {
    match err {
        ServiceError::Market(market) => match market {
            MarketError::InvalidQuery { .. } | MarketError::UnsupportedTimeframe(_) => {
                StatusCode::BAD_REQUEST
            }
            MarketError::Connection { .. } | MarketError::NotConnected => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            MarketError::RetriesExhausted { .. } | MarketError::TransientFetch { .. } => {
                StatusCode::BAD_GATEWAY
            }
            MarketError::RangeTooLarge { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            MarketError::UnknownSymbol { .. }
            | MarketError::Protocol { .. }
            | MarketError::Store { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        },
        ServiceError::AlreadyRunning => StatusCode::CONFLICT,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                kind: self.0.kind(),
                message: self.0.to_string(),
            },
        };
        (status_for(&self.0), Json(body)).into_response()
    }
}

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Relay version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Whether streaming is running.
    pub running: bool,
    /// Subscribed symbols.
    pub symbols: usize,
    /// Symbol tasks still alive.
    pub live_tasks: usize,
    /// Receivers across all topics.
    pub topic_receivers: usize,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every symbol task is alive.
    Healthy,
    /// Streaming, but some symbol tasks have exited.
    Degraded,
    /// Not streaming.
    Unhealthy,
}

// =============================================================================
// Server State
// =============================================================================

/// Shared state for the HTTP server.
pub struct HttpServerState {
    version: String,
    started_at: Instant,
    service: Arc<StreamingService>,
    hub: SharedTopicHub,
}

impl HttpServerState {
    /// Create new server state.
    #[must_use]
    pub fn new(version: String, service: Arc<StreamingService>, hub: SharedTopicHub) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            service,
            hub,
        }
    }
}

/// Build the router over `state`.
#[must_use]
pub fn router(state: Arc<HttpServerState>) -> Router {
    Router::new()
        .route("/rpc/get_kline_histories", post(history_handler))
        .route("/stream/{symbol}", get(stream_handler))
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Server
// =============================================================================

/// HTTP server for the relay.
pub struct HttpServer {
    port: u16,
    state: Arc<HttpServerState>,
    cancel: CancellationToken,
}

impl HttpServer {
    /// Create a new server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HttpServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
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
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HttpServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "HTTP server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HttpServerError::ServerFailed(e.to_string()))?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn history_handler(
    State(state): State<Arc<HttpServerState>>,
    Json(request): Json<HistoryRequest>,
) -> Response {
    let request_id = Uuid::new_v4();
    let span = info_span!(
        "get_kline_histories",
        %request_id,
        symbol = %request.symbol,
    );

    let result = async {
        let query = request.query()?;
        let bars: Vec<Bar> = state
            .service
            .get_kline_histories(&request.symbol, query)
            .await?;
        debug!(bars = bars.len(), "History served");
        Ok::<_, ApiError>(bars)
    }
    .instrument(span)
    .await;

    let mut response = match result {
        Ok(bars) => Json(bars).into_response(),
        Err(err) => err.into_response(),
    };
    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

async fn stream_handler(
    State(state): State<Arc<HttpServerState>>,
    Path(raw): Path<String>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let symbol: Symbol = raw.parse()?;
    let receiver = state.hub.subscribe(&symbol);
    debug!(%symbol, "Stream subscriber attached");

    let events = BroadcastStream::new(receiver).filter_map(|item| match item {
        Ok(event) => Event::default()
            .event(event.kind.as_str())
            .json_data(&event.payload)
            .ok()
            .map(Ok),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            metrics::record_events_lagged(skipped);
            None
        }
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn health_handler(State(state): State<Arc<HttpServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HttpServerState>>) -> impl IntoResponse {
    if state.service.is_running() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
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

fn build_health_response(state: &HttpServerState) -> HealthResponse {
    let running = state.service.is_running();
    let symbols = state.service.symbols().len();
    let live_tasks = state.service.live_tasks();

    HealthResponse {
        status: determine_health_status(running, symbols, live_tasks),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        running,
        symbols,
        live_tasks,
        topic_receivers: state.hub.stats().receivers,
    }
}

const fn determine_health_status(running: bool, symbols: usize, live_tasks: usize) -> HealthStatus {
    if !running {
        HealthStatus::Unhealthy
    } else if live_tasks < symbols {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

// =============================================================================
// Errors
// =============================================================================

/// HTTP server errors.
#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

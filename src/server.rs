// HTTP server hosting the operator terminal
//
// Routes:
// - GET /api/terminal       WebSocket upgrade into a terminal session
// - GET /api/terminal/info  Host information for the console header
// - GET /health             Liveness probe
// - GET /metrics            Prometheus scrape endpoint (when enabled)

use crate::config::{Config, ServerConfig};
use crate::metrics;
use crate::terminal::{Frame, FrameSink, FrameSource, Session, SessionConfig, TransportError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    server: Arc<ServerConfig>,
    session: SessionConfig,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: &Config, shutdown: CancellationToken) -> Self {
        Self {
            server: Arc::new(config.server.clone()),
            session: config.terminal.session_config(),
            shutdown,
        }
    }
}

/// Response body of `GET /api/terminal/info`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TerminalInfo {
    pub os: String,
    pub architecture: String,
    pub version: String,
    pub username: String,
}

/// Build the application router
pub fn router(state: AppState, metrics_enabled: bool) -> Router {
    let mut router = Router::new()
        .route("/api/terminal", get(terminal_handler))
        .route("/api/terminal/info", get(info_handler))
        .route("/health", get(health_handler));

    if metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Bind the configured address and serve until `shutdown` is cancelled
pub async fn serve(config: Config, shutdown: CancellationToken) -> Result<()> {
    let addr = config.server.socket_addr();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    serve_with_listener(listener, config, shutdown).await
}

/// Serve on an already bound listener
pub async fn serve_with_listener(
    listener: TcpListener,
    config: Config,
    shutdown: CancellationToken,
) -> Result<()> {
    metrics::init().context("Failed to initialize metrics")?;

    let state = AppState::new(&config, shutdown.clone());
    let app = router(state, config.metrics.enabled);

    info!("Starting terminal server on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Terminal server error")?;

    info!("Terminal server stopped");
    Ok(())
}

/// `GET /api/terminal`: upgrade into a terminal session.
///
/// The access gate and the origin check run before the upgrade; a request
/// that passes both but is not a WebSocket handshake gets the upgrade
/// rejection.
async fn terminal_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if let Err(response) = authorize(&headers, &state.server) {
        return response;
    }

    if state.server.enforce_same_origin && !is_same_origin(&headers) {
        warn!("Rejected terminal upgrade from foreign origin");
        return (StatusCode::FORBIDDEN, Json(json!({"error": "origin not allowed"}))).into_response();
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (ws_sink, ws_stream) = socket.split();

    let session = Session::new(
        Box::new(WsSink(ws_sink)),
        &state.shutdown,
        state.session.clone(),
    );
    debug!(session_id = %session.id(), "WebSocket upgraded");

    session.run(Box::new(WsSource(ws_stream))).await;
}

/// `GET /api/terminal/info`
async fn info_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(response) = authorize(&headers, &state.server) {
        return response;
    }

    let username = header_str(&headers, &state.server.operator_header)
        .unwrap_or_default()
        .to_string();

    Json(TerminalInfo {
        os: std::env::consts::OS.to_string(),
        architecture: std::env::consts::ARCH.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        username,
    })
    .into_response()
}

/// Metrics endpoint handler
async fn metrics_handler() -> Response {
    match metrics::gather_metrics() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error gathering metrics: {}", e),
            )
                .into_response()
        }
    }
}

/// Health check endpoint
async fn health_handler() -> impl IntoResponse {
    StatusCode::OK
}

/// The upstream access-control layer states the operator's role in a header
fn authorize(headers: &HeaderMap, server: &ServerConfig) -> Result<(), Response> {
    match header_str(headers, &server.role_header) {
        Some(role) if role == server.required_role => Ok(()),
        _ => Err((StatusCode::UNAUTHORIZED, Json(json!({"error": "no permission"}))).into_response()),
    }
}

/// An absent Origin is accepted; otherwise it has to name the Host
fn is_same_origin(headers: &HeaderMap) -> bool {
    let Some(origin) = headers.get(header::ORIGIN) else {
        return true;
    };
    match (origin.to_str(), header_str(headers, header::HOST.as_str())) {
        (Ok(origin), Some(host)) => origin.contains(host),
        _ => false,
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Write half of an upgraded socket
struct WsSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.0
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }
}

/// Read half of an upgraded socket
struct WsSource(SplitStream<WebSocket>);

#[async_trait]
impl FrameSource for WsSource {
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        let message = self.0.next().await?;
        Some(match message {
            Ok(Message::Text(text)) => Ok(Frame::Text(text.as_str().to_owned())),
            Ok(Message::Binary(bytes)) => Ok(Frame::Binary(bytes.to_vec())),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => Ok(Frame::Ping),
            Ok(Message::Close(_)) => Ok(Frame::Close),
            Err(e) => Err(TransportError::WebSocket(e.to_string())),
        })
    }
}

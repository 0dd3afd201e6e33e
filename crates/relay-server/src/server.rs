use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use relay_core::errors::{PushError, RequestError};
use relay_core::ids::ConnectionId;
use relay_telemetry::{names, MetricsRecorder};

use crate::connection::{self, LocalRegistry};
use crate::handlers::{self, HandlerResponse};
use crate::session::RelayService;

/// Inbound frames buffered per connection before the reader waits.
const INBOUND_QUEUE: usize = 64;

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
    pub max_send_queue: usize,
    pub region: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            max_send_queue: 256,
            region: "local".into(),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<RelayService>,
    pub connections: Arc<LocalRegistry>,
    pub metrics: Arc<MetricsRecorder>,
    pub region: Arc<str>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/requests", post(requests_handler))
        .route(
            "/@connections/{connection_id}",
            post(push_handler).get(info_handler).delete(delete_handler),
        )
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle that keeps it running.
///
/// `connections` owns the sockets accepted on `/ws`; `relay` may push to them
/// directly or through the management routes.
pub async fn start(
    config: ServerConfig,
    relay: Arc<RelayService>,
    connections: Arc<LocalRegistry>,
) -> Result<ServerHandle, std::io::Error> {
    // Start dead-connection cleanup task (every 60s)
    let _cleanup =
        connection::start_cleanup_task(Arc::clone(&connections), Duration::from_secs(60));

    let metrics = Arc::clone(relay.metrics());
    let app_state = AppState {
        relay: Arc::clone(&relay),
        connections: Arc::clone(&connections),
        metrics,
        region: Arc::from(config.region.as_str()),
    };

    let router = build_router(app_state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), region = %config.region, "Relay server started");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server_handle,
        _cleanup,
    })
}

/// Handle returned by `start()`; keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
    _cleanup: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}/ws", self.port)
    }

    pub fn http_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a new WebSocket connection.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (connection_id, rx) = state.connections.register();
    tracing::info!(connection_id = %connection_id, "WebSocket client connected");
    state.metrics.gauge_inc(names::OPEN_CONNECTIONS, &[], 1.0);

    // Frames are dispatched per connection, in arrival order
    let (message_tx, message_rx) = mpsc::channel::<(ConnectionId, String)>(INBOUND_QUEUE);
    tokio::spawn(process_gateway_messages(
        message_rx,
        Arc::clone(&state.relay),
        Arc::clone(&state.connections),
    ));

    connection::handle_ws_connection(
        socket,
        connection_id,
        rx,
        Arc::clone(&state.connections),
        message_tx,
    )
    .await;

    state.metrics.gauge_inc(names::OPEN_CONNECTIONS, &[], -1.0);
}

/// Process one connection's frames in arrival order.
async fn process_gateway_messages(
    mut rx: mpsc::Receiver<(ConnectionId, String)>,
    relay: Arc<RelayService>,
    connections: Arc<LocalRegistry>,
) {
    while let Some((connection_id, raw_message)) = rx.recv().await {
        if let Some(reply) = handlers::dispatch_action(&relay, &connection_id, &raw_message).await {
            // The client may already be gone; nothing else to do then
            let _ = connections.send_text(&connection_id, reply).await;
        }
    }
}

/// Start a relay session from an HTTP envelope `{"body": "<json>"}`.
async fn requests_handler(State(state): State<AppState>, body: String) -> HandlerResponse {
    match serde_json::from_str::<Value>(&body) {
        Ok(envelope) => handlers::handle_send_message(&state.relay, &envelope),
        Err(e) => RequestError::MalformedRequest(format!("invalid JSON: {e}")).into(),
    }
}

/// Deliver a raw frame to a gateway connection.
async fn push_handler(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
    body: String,
) -> impl IntoResponse {
    let id = ConnectionId::from_raw(connection_id);
    match state.connections.send_text(&id, body).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => push_error_response(e),
    }
}

/// Close a gateway connection.
async fn delete_handler(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
) -> impl IntoResponse {
    let id = ConnectionId::from_raw(connection_id);
    match state.connections.close(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => push_error_response(e),
    }
}

/// Describe a gateway connection.
async fn info_handler(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
) -> impl IntoResponse {
    let id = ConnectionId::from_raw(connection_id);
    match state.connections.connected_at(&id) {
        Some(connected_at) => Json(json!({
            "connectionId": id.as_str(),
            "connectedAt": connected_at.to_rfc3339(),
        }))
        .into_response(),
        None => push_error_response(PushError::Gone),
    }
}

fn push_error_response(err: PushError) -> axum::response::Response {
    match err {
        PushError::Gone => (StatusCode::GONE, Json(json!({ "message": "GoneException" }))).into_response(),
        other => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "message": other.to_string() })),
        )
            .into_response(),
    }
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "region": state.region.as_ref(),
        "connections": state.connections.count(),
        "activeSessions": state.relay.active_sessions(),
    }))
}

/// Current metric values as JSON.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

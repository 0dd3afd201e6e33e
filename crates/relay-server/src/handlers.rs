//! Request handlers shared by the WebSocket gateway and the HTTP routes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::{info, warn};

use relay_core::errors::{PushError, RequestError};
use relay_core::ids::ConnectionId;
use relay_core::registry::ConnectionRegistry;
use relay_core::wire::{ClientAction, ConnectAck, RelayRequest};
use relay_telemetry::names;

use crate::session::RelayService;

/// Status + JSON body returned to the immediate caller.
#[derive(Clone, Debug, PartialEq)]
pub struct HandlerResponse {
    pub status: u16,
    pub body: Value,
}

impl HandlerResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": message.into() }),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    pub fn body_text(&self) -> String {
        self.body.to_string()
    }
}

impl From<RequestError> for HandlerResponse {
    fn from(err: RequestError) -> Self {
        let message = match &err {
            RequestError::MissingField(key) => format!("Missing key in request: {key}"),
            RequestError::MalformedRequest(reason) => format!("Invalid request: {reason}"),
            RequestError::Internal(reason) => format!("Internal server error: {reason}"),
        };
        Self::error(err.status_code(), message)
    }
}

impl IntoResponse for HandlerResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.body)).into_response()
    }
}

/// Accept a relay request carried in an envelope's string-encoded `body`.
///
/// Answers before any model output is produced.
pub fn handle_send_message(relay: &RelayService, envelope: &Value) -> HandlerResponse {
    match RelayRequest::from_envelope(envelope).and_then(|request| relay.start_request(request)) {
        Ok(accepted) => {
            info!(
                session_id = %accepted.session_id,
                connection_id = %accepted.connection_id,
                "request accepted"
            );
            HandlerResponse::ok(json!({ "message": "Request received" }))
        }
        Err(e) => {
            warn!(error = %e, "request rejected");
            relay
                .metrics()
                .counter_inc(names::REQUESTS_REJECTED, &[("status", status_label(&e))], 1);
            e.into()
        }
    }
}

fn status_label(err: &RequestError) -> &'static str {
    match err.status_code() {
        400 => "400",
        _ => "500",
    }
}

/// Acknowledge a `$connect` handshake.
pub fn handle_connect(connection_id: Option<&ConnectionId>) -> HandlerResponse {
    match connection_id.filter(|id| !id.is_empty()) {
        Some(id) => {
            info!(connection_id = %id, "client connected");
            match serde_json::to_value(ConnectAck::new(id)) {
                Ok(body) => HandlerResponse::ok(body),
                Err(e) => HandlerResponse::error(500, format!("Internal server error: {e}")),
            }
        }
        None => HandlerResponse::error(400, "Missing connectionId"),
    }
}

/// Close a connection on the client's behalf.
pub async fn handle_disconnect(
    registry: &dyn ConnectionRegistry,
    connection_id: Option<&str>,
) -> HandlerResponse {
    let Some(raw) = connection_id.map(str::trim).filter(|id| !id.is_empty()) else {
        return HandlerResponse::error(400, "Missing connectionId");
    };
    let id = ConnectionId::from_raw(raw);

    match registry.delete(&id).await {
        Ok(()) => {
            info!(connection_id = %id, "client disconnected");
            HandlerResponse::ok(json!({ "message": "Disconnected successfully" }))
        }
        Err(PushError::Gone) => {
            info!(connection_id = %id, "connection already closed");
            HandlerResponse::error(410, "Connection already closed")
        }
        Err(e) => {
            warn!(connection_id = %id, error = %e, "disconnect failed");
            HandlerResponse::error(500, format!("Failed to disconnect: {e}"))
        }
    }
}

/// Route one gateway frame from `connection_id` to its handler.
///
/// Returns the text to send back on the socket, if any. Accepted relay
/// requests and successful disconnects reply nothing; their effect is the
/// stream or the close.
pub async fn dispatch_action(
    relay: &RelayService,
    connection_id: &ConnectionId,
    raw: &str,
) -> Option<String> {
    let action = match ClientAction::parse(raw) {
        Ok(action) => action,
        Err(e) => {
            warn!(connection_id = %connection_id, error = %e, "unparseable client frame");
            return Some(HandlerResponse::from(e).body_text());
        }
    };

    match action {
        ClientAction::Connect => Some(handle_connect(Some(connection_id)).body_text()),
        ClientAction::SendMessage { body } => {
            let envelope = json!({ "body": body });
            let response = handle_send_message(relay, &envelope);
            (!response.is_ok()).then(|| response.body_text())
        }
        ClientAction::Disconnect {
            connection_id: target,
        } => {
            let target = target.unwrap_or_else(|| connection_id.to_string());
            let response = handle_disconnect(relay.registry().as_ref(), Some(&target)).await;
            (!response.is_ok()).then(|| response.body_text())
        }
    }
}

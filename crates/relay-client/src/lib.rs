//! Consumer side of the relay protocol: handshake, request, stream, disconnect.

use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use relay_core::ids::ConnectionId;

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(120);

pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] WsError),
    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// Meaning of one inbound frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    /// `{"message": text}`
    Content(String),
    /// Terminal marker, top-level or nested inside `message`.
    Done,
    /// `{"type":"error"}` frame or an `{"error": ..}` reply.
    Error(String),
    /// Not a JSON object; the text itself is output.
    Raw(String),
    /// A JSON object with nothing to show.
    Ignored,
}

/// Classify an inbound text frame.
pub fn classify(text: &str) -> Inbound {
    let map = match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => map,
        _ => return Inbound::Raw(text.to_string()),
    };

    match map.get("type").and_then(Value::as_str) {
        Some("done") => return Inbound::Done,
        Some("error") => {
            let message = map
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Inbound::Error(message.to_string());
        }
        _ => {}
    }

    if let Some(error) = map.get("error") {
        return Inbound::Error(match error {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
    }

    match map.get("message") {
        Some(Value::String(s)) if is_done_marker(s) => Inbound::Done,
        Some(Value::String(s)) => Inbound::Content(s.clone()),
        Some(Value::Object(inner)) if inner.get("type").and_then(Value::as_str) == Some("done") => {
            Inbound::Done
        }
        _ => Inbound::Ignored,
    }
}

/// Double-wrapped marker: `{"message": "{\"type\":\"done\"}"}`.
fn is_done_marker(text: &str) -> bool {
    let trimmed = text.trim_start();
    if !trimmed.starts_with('{') {
        return false;
    }
    serde_json::from_str::<Value>(trimmed)
        .ok()
        .and_then(|v| v.get("type").and_then(Value::as_str).map(|t| t == "done"))
        .unwrap_or(false)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    AwaitingConnectionId,
    Streaming,
    Done,
    Closed,
}

/// How streaming ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEnd {
    /// The terminal marker arrived.
    Marker,
    /// An error frame arrived.
    Error(String),
    /// The transport closed first. Output so far is the answer.
    Closed,
    /// Nothing arrived within the read timeout.
    TimedOut,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transcript {
    pub connection_id: ConnectionId,
    pub text: String,
    pub end: StreamEnd,
}

/// Runs one request over a relay connection.
pub struct ClientDriver<S> {
    ws: S,
    state: ClientState,
    connection_id: Option<ConnectionId>,
    read_timeout: Duration,
}

/// Open a WebSocket to `url` and wrap it in a driver.
pub async fn connect(url: &str) -> Result<ClientDriver<WsStream>, ClientError> {
    let (ws, _) = tokio_tungstenite::connect_async(url).await?;
    info!(url, "connection opened");
    Ok(ClientDriver::new(ws))
}

impl<S> ClientDriver<S>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    pub fn new(ws: S) -> Self {
        Self {
            ws,
            state: ClientState::Connecting,
            connection_id: None,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn connection_id(&self) -> Option<&ConnectionId> {
        self.connection_id.as_ref()
    }

    /// Handshake, send `prompt`, and stream the answer into `on_delta`.
    ///
    /// The disconnect request is sent whenever a connection id was obtained,
    /// however streaming ended.
    pub async fn run<F>(&mut self, prompt: &str, mut on_delta: F) -> Result<Transcript, ClientError>
    where
        F: FnMut(&str),
    {
        self.state = ClientState::Connecting;
        if let Err(e) = self.send_json(json!({ "action": "$connect" })).await {
            self.state = ClientState::Closed;
            return Err(e);
        }

        self.state = ClientState::AwaitingConnectionId;
        let connection_id = match self.await_connection_id().await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "handshake failed");
                self.state = ClientState::Closed;
                let _ = self.ws.close().await;
                return Err(e);
            }
        };
        debug!(connection_id = %connection_id, "connection id received");
        self.connection_id = Some(connection_id.clone());

        self.state = ClientState::Streaming;
        let mut text = String::new();
        let body = json!({ "prompt": prompt, "connectionId": connection_id.as_str() }).to_string();
        let end = match self
            .send_json(json!({ "action": "sendMessage", "body": body }))
            .await
        {
            Ok(()) => self.stream(&mut text, &mut on_delta).await,
            Err(e) => {
                warn!(error = %e, "failed to send request");
                StreamEnd::Closed
            }
        };
        info!(connection_id = %connection_id, end = ?end, chars = text.len(), "stream ended");

        self.disconnect(&connection_id).await;
        self.state = match end {
            StreamEnd::Marker => ClientState::Done,
            _ => ClientState::Closed,
        };

        Ok(Transcript {
            connection_id,
            text,
            end,
        })
    }

    async fn send_json(&mut self, value: Value) -> Result<(), ClientError> {
        self.ws.send(Message::Text(value.to_string().into())).await?;
        Ok(())
    }

    /// Next text payload, skipping control frames. `None` once the transport is done.
    async fn next_text(&mut self) -> Result<Option<String>, tokio::time::error::Elapsed> {
        loop {
            let next = tokio::time::timeout(self.read_timeout, self.ws.next()).await?;
            match next {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().to_string())),
                Some(Ok(Message::Binary(bytes))) => {
                    return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!(error = %e, "transport error while reading");
                    return Ok(None);
                }
            }
        }
    }

    async fn await_connection_id(&mut self) -> Result<ConnectionId, ClientError> {
        let text = match self.next_text().await {
            Ok(Some(text)) => text,
            Ok(None) => {
                return Err(ClientError::Handshake(
                    "connection closed before acknowledgment".into(),
                ))
            }
            Err(_) => return Err(ClientError::Handshake("timed out waiting for acknowledgment".into())),
        };

        let ack: Value = serde_json::from_str(&text)
            .map_err(|e| ClientError::Handshake(format!("unreadable acknowledgment: {e}")))?;
        match ack.get("connectionId").and_then(Value::as_str) {
            Some(id) if !id.trim().is_empty() => Ok(ConnectionId::from_raw(id)),
            _ => Err(ClientError::Handshake(format!(
                "acknowledgment has no connectionId: {text}"
            ))),
        }
    }

    async fn stream<F>(&mut self, text: &mut String, on_delta: &mut F) -> StreamEnd
    where
        F: FnMut(&str),
    {
        loop {
            let payload = match self.next_text().await {
                Ok(Some(payload)) => payload,
                Ok(None) => return StreamEnd::Closed,
                Err(_) => {
                    warn!(timeout = ?self.read_timeout, "no frame within read timeout");
                    return StreamEnd::TimedOut;
                }
            };

            match classify(&payload) {
                Inbound::Content(delta) | Inbound::Raw(delta) => {
                    on_delta(&delta);
                    text.push_str(&delta);
                }
                Inbound::Done => return StreamEnd::Marker,
                Inbound::Error(message) => {
                    warn!(error = %message, "relay reported an error");
                    return StreamEnd::Error(message);
                }
                Inbound::Ignored => debug!(payload = %payload, "ignoring frame"),
            }
        }
    }

    async fn disconnect(&mut self, connection_id: &ConnectionId) {
        let request = json!({ "action": "disconnect", "connectionId": connection_id.as_str() });
        if let Err(e) = self.send_json(request).await {
            debug!(error = %e, "disconnect request not delivered");
        }
        if let Err(e) = self.ws.close().await {
            debug!(error = %e, "close failed");
        }
    }
}

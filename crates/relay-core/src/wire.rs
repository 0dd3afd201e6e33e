//! JSON frames exchanged between clients, the gateway and the relay.

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::errors::RequestError;
use crate::ids::ConnectionId;

/// A frame pushed from the relay to a client connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundMessage {
    /// `{"message": text}`
    Content(String),
    /// `{"type": "done"}`
    Done,
    /// `{"type": "error", "message": text}`
    Error(String),
}

impl OutboundMessage {
    pub fn content(text: impl Into<String>) -> Self {
        Self::Content(text.into())
    }

    /// Build the frame carrying a backend failure in the given style.
    pub fn for_error(style: ErrorFrameStyle, text: impl Into<String>) -> Self {
        let text = text.into();
        match style {
            ErrorFrameStyle::Typed => Self::Error(text),
            ErrorFrameStyle::Legacy => Self::Content(format!("Error: {text}")),
        }
    }

    pub fn to_json(&self) -> String {
        // Serializing a map of strings cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Content(_) => "content",
            Self::Done => "done",
            Self::Error(_) => "error",
        }
    }
}

impl Serialize for OutboundMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Content(text) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("message", text)?;
                map.end()
            }
            Self::Done => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("type", "done")?;
                map.end()
            }
            Self::Error(text) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("type", "error")?;
                map.serialize_entry("message", text)?;
                map.end()
            }
        }
    }
}

/// How backend failures are framed on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ErrorFrameStyle {
    /// Dedicated `{"type":"error"}` frame.
    #[default]
    Typed,
    /// Error text inside a plain `{"message":..}` frame, indistinguishable from content.
    Legacy,
}

impl std::str::FromStr for ErrorFrameStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "typed" => Ok(Self::Typed),
            "legacy" => Ok(Self::Legacy),
            other => Err(format!("unknown error frame style `{other}` (expected typed or legacy)")),
        }
    }
}

/// Inbound client frames, routed on the `action` key.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "action")]
pub enum ClientAction {
    #[serde(rename = "$connect")]
    Connect,
    #[serde(rename = "sendMessage")]
    SendMessage {
        #[serde(default)]
        body: Option<Value>,
    },
    #[serde(rename = "disconnect")]
    Disconnect {
        #[serde(rename = "connectionId", default)]
        connection_id: Option<String>,
    },
}

impl ClientAction {
    pub fn parse(text: &str) -> Result<Self, RequestError> {
        serde_json::from_str(text).map_err(|e| RequestError::MalformedRequest(e.to_string()))
    }
}

/// A validated relay request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayRequest {
    pub connection_id: ConnectionId,
    pub prompt: String,
}

impl RelayRequest {
    pub fn new(connection_id: &str, prompt: &str) -> Result<Self, RequestError> {
        if connection_id.trim().is_empty() {
            return Err(RequestError::MalformedRequest(
                "`connectionId` must not be empty".into(),
            ));
        }
        if prompt.trim().is_empty() {
            return Err(RequestError::MalformedRequest("`prompt` must not be empty".into()));
        }
        Ok(Self {
            connection_id: ConnectionId::from_raw(connection_id),
            prompt: prompt.to_string(),
        })
    }

    /// Parse the string-encoded request body `{"prompt":..,"connectionId":..}`.
    pub fn parse_body(body: &str) -> Result<Self, RequestError> {
        let value: Value = serde_json::from_str(body)
            .map_err(|e| RequestError::MalformedRequest(format!("invalid JSON: {e}")))?;
        let obj = value
            .as_object()
            .ok_or_else(|| RequestError::MalformedRequest("body must be a JSON object".into()))?;
        let prompt = require_str(obj, "prompt")?;
        let connection_id = require_str(obj, "connectionId")?;
        Self::new(connection_id, prompt)
    }

    /// Extract the request from an envelope whose `body` holds the encoded request.
    pub fn from_envelope(envelope: &Value) -> Result<Self, RequestError> {
        match envelope.get("body") {
            Some(Value::String(body)) => Self::parse_body(body),
            Some(Value::Null) | None => Err(RequestError::MissingField("body".into())),
            Some(_) => Err(RequestError::MalformedRequest(
                "body must be a JSON-encoded string".into(),
            )),
        }
    }
}

fn require_str<'a>(obj: &'a Map<String, Value>, key: &str) -> Result<&'a str, RequestError> {
    match obj.get(key) {
        None | Some(Value::Null) => Err(RequestError::MissingField(key.to_string())),
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(_) => Err(RequestError::MalformedRequest(format!("`{key}` must be a string"))),
    }
}

/// Acknowledgment sent after a `$connect` handshake.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectAck {
    pub message: String,
    #[serde(rename = "connectionId")]
    pub connection_id: String,
}

impl ConnectAck {
    pub fn new(connection_id: &ConnectionId) -> Self {
        Self {
            message: "Connected successfully".into(),
            connection_id: connection_id.to_string(),
        }
    }
}

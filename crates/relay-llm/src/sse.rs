use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use relay_core::errors::BackendError;
use relay_core::stream::StreamEvent;

/// Classifies streamed Messages API chunks into relay stream events.
///
/// The chunk kind is read from the `type` field of the JSON payload, with the
/// SSE `event:` name as a fallback. Unrecognized kinds are dropped.
#[derive(Debug, Default)]
pub struct SseParser {
    finished: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a stop chunk has already been seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Parse a single SSE event and return zero or more StreamEvents.
    pub fn parse_event(&mut self, event_type: &str, data: &str) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        let payload: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                debug!(event_type, error = %e, "dropping undecodable chunk");
                return events;
            }
        };
        let kind = payload
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or(event_type)
            .to_string();

        match kind.as_str() {
            "content_block_delta" => {
                if let Ok(delta) = serde_json::from_value::<ContentBlockDeltaEvent>(payload) {
                    match delta.delta.get("type").and_then(|t| t.as_str()) {
                        Some("text_delta") => {
                            let text = delta
                                .delta
                                .get("text")
                                .and_then(|t| t.as_str())
                                .unwrap_or("");
                            events.push(StreamEvent::delta(text));
                        }
                        other => {
                            debug!(delta_type = ?other, "dropping non-text delta");
                        }
                    }
                }
            }

            "content_block_stop" | "message_stop" => {
                if !self.finished {
                    self.finished = true;
                    events.push(StreamEvent::Done);
                }
            }

            "error" => match serde_json::from_value::<ErrorEvent>(payload) {
                Ok(err) => events.push(StreamEvent::error(classify_error(&err))),
                Err(e) => events.push(StreamEvent::error(BackendError::ServerError {
                    status: 500,
                    body: format!("unparseable error chunk: {e}"),
                })),
            },

            "message_start" | "content_block_start" | "message_delta" | "ping" => {}

            other => {
                debug!(chunk_kind = other, "dropping unrecognized chunk kind");
            }
        }

        events
    }
}

fn classify_error(err: &ErrorEvent) -> BackendError {
    match err.error.error_type.as_str() {
        "overloaded_error" => BackendError::Overloaded,
        "rate_limit_error" | "throttling_error" => BackendError::RateLimited { retry_after: None },
        "authentication_error" | "permission_error" => {
            BackendError::AuthenticationFailed(err.error.message.clone())
        }
        "invalid_request_error" | "not_found_error" => {
            BackendError::InvalidRequest(err.error.message.clone())
        }
        "timeout_error" => BackendError::StreamInterrupted(err.error.message.clone()),
        _ => BackendError::ServerError {
            status: 500,
            body: err.error.message.clone(),
        },
    }
}

/// Parse raw SSE text into (event_type, data) pairs.
///
/// Events without an `event:` line get an empty event type; multi-line data
/// is joined with newlines.
pub fn parse_sse_lines(raw: &str) -> Vec<(String, String)> {
    let mut events = Vec::new();
    let mut current_event = String::new();
    let mut data_lines: Vec<&str> = Vec::new();

    for line in raw.lines() {
        if let Some(event) = line.strip_prefix("event:") {
            current_event = event.trim_start().to_string();
        } else if let Some(data) = line.strip_prefix("data:") {
            data_lines.push(data.strip_prefix(' ').unwrap_or(data));
        } else if line.is_empty() && (!current_event.is_empty() || !data_lines.is_empty()) {
            events.push((std::mem::take(&mut current_event), data_lines.join("\n")));
            data_lines.clear();
        }
    }

    // Handle trailing event without blank line
    if !current_event.is_empty() || !data_lines.is_empty() {
        events.push((current_event, data_lines.join("\n")));
    }

    events
}

// --- Deserialization types for streamed chunks ---

#[derive(Deserialize)]
struct ContentBlockDeltaEvent {
    delta: Value,
}

#[derive(Deserialize)]
struct ErrorEvent {
    error: ErrorPayload,
}

#[derive(Deserialize)]
struct ErrorPayload {
    #[serde(rename = "type")]
    error_type: String,
    #[serde(default)]
    message: String,
}

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, Future, Stream};
use reqwest::Client;
use secrecy::ExposeSecret;
use serde_json::json;
use tracing::{debug, instrument, warn};

use relay_core::config::ModelConfig;
use relay_core::errors::BackendError;
use relay_core::source::ModelStreamSource;
use relay_core::stream::{EventStream, StreamEvent};

use crate::sse::{self, SseParser};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Streams completions from a Messages API endpoint over SSE.
///
/// One HTTP request per `open`; failures are reported as a single error
/// event and never retried.
pub struct AnthropicStreamSource {
    client: Client,
    config: ModelConfig,
}

impl AnthropicStreamSource {
    pub fn new(config: ModelConfig) -> Result<Self, BackendError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| BackendError::NetworkError(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    fn build_request(&self, prompt: &str) -> reqwest::RequestBuilder {
        let body = json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "stream": true,
            "messages": [{
                "role": "user",
                "content": [{ "type": "text", "text": prompt }],
            }],
        });

        let mut req = self.client.post(&self.config.url);
        if let Some(key) = &self.config.api_key {
            req = req.header("x-api-key", key.expose_secret());
        }
        req.header("anthropic-version", ANTHROPIC_VERSION)
            .header("accept", "text/event-stream")
            .header("content-type", "application/json")
            .json(&body)
    }

    async fn connect(&self, prompt: &str) -> Result<EventStream, BackendError> {
        let resp = self.build_request(prompt).send().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout(self.config.connect_timeout)
            } else {
                BackendError::NetworkError(e.to_string())
            }
        })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status, body));
        }

        let stream = SseStream::with_idle_timeout(resp.bytes_stream(), self.config.read_timeout);
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl ModelStreamSource for AnthropicStreamSource {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    #[instrument(skip(self, prompt), fields(model = %self.config.model))]
    async fn open(&self, prompt: &str) -> EventStream {
        match self.connect(prompt).await {
            Ok(stream) => {
                debug!("model stream opened");
                stream
            }
            Err(error) => {
                warn!(error = %error, error_kind = error.error_kind(), "model call failed");
                Box::pin(stream::once(async move { StreamEvent::error(error) }))
            }
        }
    }
}

/// Wraps a byte stream from reqwest and yields StreamEvents.
/// If no data arrives within `idle_duration`, emits an error and ends.
/// The stream also ends right after the first error event.
struct SseStream {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    parser: SseParser,
    // Raw bytes; events are only decoded once complete so multi-byte
    // characters split across reads survive.
    buffer: Vec<u8>,
    pending: Vec<StreamEvent>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    ended: bool,
}

impl SseStream {
    fn with_idle_timeout(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            parser: SseParser::new(),
            buffer: Vec::new(),
            pending: Vec::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            ended: false,
        }
    }

    fn drain_buffer(&mut self, flush: bool) {
        while let Some((pos, len)) = find_event_boundary(&self.buffer) {
            let chunk: Vec<u8> = self.buffer.drain(..pos + len).collect();
            self.parse_chunk(&String::from_utf8_lossy(&chunk));
        }
        if flush && !self.buffer.is_empty() {
            let remaining = std::mem::take(&mut self.buffer);
            self.parse_chunk(&String::from_utf8_lossy(&remaining));
        }
    }

    fn parse_chunk(&mut self, chunk: &str) {
        let chunk = chunk.replace("\r\n", "\n").replace('\r', "\n");
        for (event_type, data) in sse::parse_sse_lines(&chunk) {
            let events = self.parser.parse_event(&event_type, &data);
            self.pending.extend(events);
        }
    }

    fn next_pending(&mut self) -> Option<StreamEvent> {
        if self.pending.is_empty() {
            return None;
        }
        let event = self.pending.remove(0);
        if matches!(event, StreamEvent::Error { .. }) {
            self.ended = true;
            self.pending.clear();
        }
        Some(event)
    }
}

/// Start and length of the first blank line ending an event.
/// Lines may end in `\n`, `\r\n` or a lone `\r`.
fn find_event_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    (0..buf.len()).find_map(|i| {
        let rest = &buf[i..];
        if rest.starts_with(b"\r\n\r\n") {
            Some((i, 4))
        } else if rest.starts_with(b"\n\n") || rest.starts_with(b"\r\r") {
            Some((i, 2))
        } else {
            None
        }
    })
}

impl Stream for SseStream {
    type Item = StreamEvent;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        if let Some(event) = self.next_pending() {
            return std::task::Poll::Ready(Some(event));
        }
        if self.ended {
            return std::task::Poll::Ready(None);
        }

        loop {
            match self.inner.as_mut().poll_next(cx) {
                std::task::Poll::Ready(Some(Ok(bytes))) => {
                    // Data received, reset idle timer
                    let new_deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(new_deadline);

                    self.buffer.extend_from_slice(&bytes);
                    self.drain_buffer(false);

                    if let Some(event) = self.next_pending() {
                        return std::task::Poll::Ready(Some(event));
                    }
                }
                std::task::Poll::Ready(Some(Err(e))) => {
                    self.ended = true;
                    return std::task::Poll::Ready(Some(StreamEvent::error(
                        BackendError::StreamInterrupted(e.to_string()),
                    )));
                }
                std::task::Poll::Ready(None) => {
                    self.drain_buffer(true);
                    self.ended = true;
                    return std::task::Poll::Ready(self.next_pending());
                }
                std::task::Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        self.ended = true;
                        return std::task::Poll::Ready(Some(StreamEvent::error(
                            BackendError::StreamInterrupted(format!(
                                "idle timeout after {}s",
                                self.idle_duration.as_secs()
                            )),
                        )));
                    }
                    return std::task::Poll::Pending;
                }
            }
        }
    }
}

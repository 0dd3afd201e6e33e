use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use parking_lot::Mutex;

use relay_core::errors::BackendError;
use relay_core::source::ModelStreamSource;
use relay_core::stream::{EventStream, StreamEvent};

/// Pre-programmed responses for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Yield a sequence of StreamEvents.
    Stream(Vec<StreamEvent>),
    /// Yield events one at a time with a pause before each.
    Trickle(Vec<StreamEvent>, Duration),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// One delta per fragment, then the stop signal.
    pub fn stream_text(fragments: &[&str]) -> Self {
        let mut events: Vec<StreamEvent> = fragments.iter().map(|f| StreamEvent::delta(*f)).collect();
        events.push(StreamEvent::Done);
        Self::Stream(events)
    }

    /// Fragments followed by a backend failure.
    pub fn stream_error(fragments: &[&str], error: BackendError) -> Self {
        let mut events: Vec<StreamEvent> = fragments.iter().map(|f| StreamEvent::delta(*f)).collect();
        events.push(StreamEvent::error(error));
        Self::Stream(events)
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock source that returns pre-programmed responses in sequence.
pub struct MockSource {
    responses: Vec<MockResponse>,
    call_count: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl MockSource {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses,
            call_count: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl ModelStreamSource for MockSource {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn open(&self, prompt: &str) -> EventStream {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.prompts.lock().push(prompt.to_string());

        match self.responses.get(idx) {
            Some(response) => resolve_response(response.clone()).await,
            None => Box::pin(stream::once(async move {
                StreamEvent::error(BackendError::InvalidRequest(format!(
                    "MockSource: no response configured for call {idx}"
                )))
            })),
        }
    }
}

/// Resolve a MockResponse, sleeping for each enclosing Delay first.
async fn resolve_response(mut current: MockResponse) -> EventStream {
    loop {
        match current {
            MockResponse::Stream(events) => return Box::pin(stream::iter(events)),
            MockResponse::Trickle(events, pause) => {
                return Box::pin(stream::iter(events).then(move |event| async move {
                    tokio::time::sleep(pause).await;
                    event
                }));
            }
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_responses_in_order() {
        let source = MockSource::new(vec![
            MockResponse::stream_text(&["Hi", " there"]),
            MockResponse::stream_error(&[], BackendError::Overloaded),
        ]);

        let first: Vec<StreamEvent> = source.open("one").await.collect().await;
        assert_eq!(
            first,
            vec![StreamEvent::delta("Hi"), StreamEvent::delta(" there"), StreamEvent::Done]
        );

        let second: Vec<StreamEvent> = source.open("two").await.collect().await;
        assert_eq!(second, vec![StreamEvent::error(BackendError::Overloaded)]);

        assert_eq!(source.call_count(), 2);
        assert_eq!(source.prompts(), vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn exhausted_source_yields_error() {
        let source = MockSource::new(vec![]);
        let events: Vec<StreamEvent> = source.open("x").await.collect().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Error { .. }));
    }

    #[tokio::test]
    async fn delayed_response_waits() {
        tokio::time::pause();
        let source = MockSource::new(vec![MockResponse::delayed(
            Duration::from_secs(10),
            MockResponse::stream_text(&["late"]),
        )]);

        let start = tokio::time::Instant::now();
        let events: Vec<StreamEvent> = source.open("x").await.collect().await;
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn trickle_spaces_out_events() {
        tokio::time::pause();
        let source = MockSource::new(vec![MockResponse::Trickle(
            vec![StreamEvent::delta("a"), StreamEvent::delta("b")],
            Duration::from_millis(100),
        )]);

        let start = tokio::time::Instant::now();
        let events: Vec<StreamEvent> = source.open("x").await.collect().await;
        assert_eq!(events.len(), 2);
        assert!(start.elapsed() >= Duration::from_millis(200));
    }
}

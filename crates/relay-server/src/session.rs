use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};

use relay_core::errors::{PushError, RequestError};
use relay_core::ids::{ConnectionId, SessionId};
use relay_core::registry::ConnectionRegistry;
use relay_core::retrieval::{self, Retriever, DEFAULT_MAX_RESULTS, DEFAULT_MIN_SCORE};
use relay_core::source::ModelStreamSource;
use relay_core::stream::StreamEvent;
use relay_core::wire::{ErrorFrameStyle, OutboundMessage, RelayRequest};
use relay_telemetry::{names, MetricsRecorder};

/// Per-service knobs applied to every session.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub error_frames: ErrorFrameStyle,
    pub min_score: f64,
    pub max_results: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            error_frames: ErrorFrameStyle::Typed,
            min_score: DEFAULT_MIN_SCORE,
            max_results: DEFAULT_MAX_RESULTS,
        }
    }
}

/// Handed back once a request is accepted. Streaming continues in the background.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Accepted {
    pub session_id: SessionId,
    pub connection_id: ConnectionId,
}

/// How a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The source signalled a stop.
    Completed,
    /// The source reported an error; an error frame was pushed.
    Failed,
    /// The source ended without a stop signal.
    Truncated,
    /// The client disappeared; nothing more was pushed.
    Gone,
}

impl SessionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Truncated => "truncated",
            Self::Gone => "gone",
        }
    }
}

/// Result of one push, as far as the session loop cares.
enum Delivery {
    Delivered,
    Failed,
    Gone,
}

/// Accepts relay requests and runs one streaming session per request.
///
/// Collaborators are injected; nothing here is process-global.
pub struct RelayService {
    source: Arc<dyn ModelStreamSource>,
    registry: Arc<dyn ConnectionRegistry>,
    retriever: Option<Arc<dyn Retriever>>,
    options: SessionOptions,
    metrics: Arc<MetricsRecorder>,
    tracker: TaskTracker,
}

impl RelayService {
    pub fn new(
        source: Arc<dyn ModelStreamSource>,
        registry: Arc<dyn ConnectionRegistry>,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            source,
            registry,
            retriever: None,
            options: SessionOptions::default(),
            metrics,
            tracker: TaskTracker::new(),
        }
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn registry(&self) -> &Arc<dyn ConnectionRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    /// Sessions currently streaming.
    pub fn active_sessions(&self) -> usize {
        self.tracker.len()
    }

    /// Validate a request and start streaming to its connection.
    ///
    /// Returns as soon as the session is scheduled; the model call happens afterwards.
    pub fn start(&self, connection_id: &str, prompt: &str) -> Result<Accepted, RequestError> {
        let request = RelayRequest::new(connection_id, prompt)?;
        self.start_request(request)
    }

    pub fn start_request(&self, request: RelayRequest) -> Result<Accepted, RequestError> {
        if self.tracker.is_closed() {
            return Err(RequestError::Internal("relay is shutting down".into()));
        }

        let session = self.session(request);
        let accepted = Accepted {
            session_id: session.session_id.clone(),
            connection_id: session.connection_id.clone(),
        };
        let span = info_span!(
            "relay_session",
            session_id = %accepted.session_id,
            connection_id = %accepted.connection_id,
            source = self.source.name(),
        );
        self.metrics.counter_inc(names::SESSIONS_STARTED, &[], 1);
        let _ = self.tracker.spawn(
            async move {
                session.run().await;
            }
            .instrument(span),
        );
        Ok(accepted)
    }

    /// Build a session without scheduling it.
    pub fn session(&self, request: RelayRequest) -> RelaySession {
        RelaySession {
            session_id: SessionId::new(),
            connection_id: request.connection_id,
            prompt: request.prompt,
            source: Arc::clone(&self.source),
            registry: Arc::clone(&self.registry),
            retriever: self.retriever.clone(),
            options: self.options.clone(),
            metrics: Arc::clone(&self.metrics),
        }
    }

    /// Stop accepting requests and wait for running sessions to finish.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// One request's stream, pushed to one connection.
pub struct RelaySession {
    session_id: SessionId,
    connection_id: ConnectionId,
    prompt: String,
    source: Arc<dyn ModelStreamSource>,
    registry: Arc<dyn ConnectionRegistry>,
    retriever: Option<Arc<dyn Retriever>>,
    options: SessionOptions,
    metrics: Arc<MetricsRecorder>,
}

impl RelaySession {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Drain the model stream into the connection.
    ///
    /// Pushes are issued one at a time in stream order. The done marker is
    /// pushed exactly once as the final frame unless the client is gone.
    pub async fn run(self) -> SessionOutcome {
        let started = Instant::now();
        let (prompt, citations) = self.prepare().await;

        let mut events = self.source.open(&prompt).await;
        let mut outcome = SessionOutcome::Truncated;

        while let Some(event) = events.next().await {
            match event {
                StreamEvent::Delta { text } => {
                    match self.push(OutboundMessage::Content(text)).await {
                        Delivery::Delivered => {
                            self.metrics.counter_inc(names::DELTAS_PUSHED, &[], 1);
                        }
                        Delivery::Failed => {}
                        Delivery::Gone => return self.finish(SessionOutcome::Gone, started),
                    }
                }
                StreamEvent::Done => {
                    outcome = SessionOutcome::Completed;
                    break;
                }
                StreamEvent::Error { error } => {
                    warn!(error = %error, kind = error.error_kind(), "model stream failed");
                    self.metrics
                        .counter_inc(names::BACKEND_ERRORS, &[("kind", error.error_kind())], 1);
                    let frame = OutboundMessage::for_error(self.options.error_frames, error.to_string());
                    if let Delivery::Gone = self.push(frame).await {
                        return self.finish(SessionOutcome::Gone, started);
                    }
                    outcome = SessionOutcome::Failed;
                    break;
                }
            }
        }
        drop(events);

        if outcome == SessionOutcome::Truncated {
            warn!("model stream ended without a stop signal");
        }

        if outcome == SessionOutcome::Completed {
            if let Some(block) = citations {
                if let Delivery::Gone = self.push(OutboundMessage::Content(block)).await {
                    return self.finish(SessionOutcome::Gone, started);
                }
            }
        }

        if let Delivery::Gone = self.push(OutboundMessage::Done).await {
            return self.finish(SessionOutcome::Gone, started);
        }
        self.finish(outcome, started)
    }

    /// Ground the prompt in retrieved snippets, if a retriever is configured.
    async fn prepare(&self) -> (String, Option<String>) {
        let Some(retriever) = &self.retriever else {
            return (self.prompt.clone(), None);
        };

        match retriever.retrieve(&self.prompt).await {
            Ok(results) => {
                let relevant =
                    retrieval::filter_relevant(results, self.options.min_score, self.options.max_results);
                debug!(relevant = relevant.len(), "retrieval finished");
                (
                    retrieval::contextualize(&self.prompt, &relevant),
                    retrieval::format_citations(&relevant),
                )
            }
            Err(e) => {
                warn!(error = %e, "retrieval failed, answering without context");
                (self.prompt.clone(), None)
            }
        }
    }

    async fn push(&self, message: OutboundMessage) -> Delivery {
        match self.registry.push(&self.connection_id, &message).await {
            Ok(()) => Delivery::Delivered,
            Err(PushError::Gone) => {
                info!(kind = message.kind(), "connection gone, stopping session");
                self.metrics.counter_inc(names::CONNECTIONS_GONE, &[], 1);
                Delivery::Gone
            }
            Err(e) => {
                warn!(error = %e, kind = message.kind(), "push failed");
                self.metrics.counter_inc(names::PUSH_FAILURES, &[], 1);
                Delivery::Failed
            }
        }
    }

    fn finish(&self, outcome: SessionOutcome, started: Instant) -> SessionOutcome {
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.metrics
            .histogram_observe(names::SESSION_DURATION_MS, &[], elapsed_ms);
        self.metrics
            .counter_inc(names::SESSIONS_FINISHED, &[("outcome", outcome.as_str())], 1);
        info!(outcome = outcome.as_str(), elapsed_ms = elapsed_ms as u64, "session finished");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use relay_core::errors::BackendError;
    use relay_core::retrieval::RetrievalResult;
    use relay_llm::{MockResponse, MockSource};

    /// Records every frame; can be told to fail specific pushes.
    #[derive(Default)]
    struct ScriptedRegistry {
        frames: Mutex<Vec<String>>,
        attempts: Mutex<usize>,
        gone_at: Option<usize>,
        reject_at: Option<usize>,
    }

    impl ScriptedRegistry {
        fn gone_at(n: usize) -> Self {
            Self {
                gone_at: Some(n),
                ..Default::default()
            }
        }

        fn reject_at(n: usize) -> Self {
            Self {
                reject_at: Some(n),
                ..Default::default()
            }
        }

        fn frames(&self) -> Vec<String> {
            self.frames.lock().clone()
        }

        fn attempts(&self) -> usize {
            *self.attempts.lock()
        }
    }

    #[async_trait]
    impl ConnectionRegistry for ScriptedRegistry {
        async fn push(
            &self,
            _connection_id: &ConnectionId,
            message: &OutboundMessage,
        ) -> Result<(), PushError> {
            let attempt = {
                let mut attempts = self.attempts.lock();
                let current = *attempts;
                *attempts += 1;
                current
            };
            if self.gone_at.is_some_and(|n| attempt >= n) {
                return Err(PushError::Gone);
            }
            if self.reject_at == Some(attempt) {
                return Err(PushError::Rejected {
                    status: 500,
                    body: "boom".into(),
                });
            }
            self.frames.lock().push(message.to_json());
            Ok(())
        }

        async fn delete(&self, _connection_id: &ConnectionId) -> Result<(), PushError> {
            Ok(())
        }
    }

    struct FixedRetriever(Result<Vec<RetrievalResult>, BackendError>);

    #[async_trait]
    impl Retriever for FixedRetriever {
        async fn retrieve(&self, _query: &str) -> Result<Vec<RetrievalResult>, BackendError> {
            self.0.clone()
        }
    }

    fn service(source: Arc<MockSource>, registry: Arc<ScriptedRegistry>) -> RelayService {
        RelayService::new(source, registry, Arc::new(MetricsRecorder::new()))
    }

    fn request(prompt: &str) -> RelayRequest {
        RelayRequest::new("Yb2Q=", prompt).unwrap()
    }

    #[tokio::test]
    async fn streams_deltas_then_done() {
        let source = Arc::new(MockSource::new(vec![MockResponse::stream_text(&["Hi", " there"])]));
        let registry = Arc::new(ScriptedRegistry::default());
        let relay = service(source.clone(), registry.clone());

        let outcome = relay.session(request("Hello")).run().await;

        assert_eq!(outcome, SessionOutcome::Completed);
        assert_eq!(
            registry.frames(),
            vec![
                r#"{"message":"Hi"}"#,
                r#"{"message":" there"}"#,
                r#"{"type":"done"}"#,
            ]
        );
        assert_eq!(source.prompts(), vec!["Hello".to_string()]);
        assert_eq!(relay.metrics().counter_get(names::DELTAS_PUSHED, &[]), 2);
    }

    #[tokio::test]
    async fn backend_error_pushes_error_frame_then_done() {
        let source = Arc::new(MockSource::new(vec![MockResponse::stream_error(
            &["Hi"],
            BackendError::Overloaded,
        )]));
        let registry = Arc::new(ScriptedRegistry::default());
        let relay = service(source.clone(), registry.clone());

        let outcome = relay.session(request("Hello")).run().await;

        assert_eq!(outcome, SessionOutcome::Failed);
        assert_eq!(
            registry.frames(),
            vec![
                r#"{"message":"Hi"}"#,
                r#"{"type":"error","message":"backend overloaded"}"#,
                r#"{"type":"done"}"#,
            ]
        );
        // Never retried
        assert_eq!(source.call_count(), 1);
        assert_eq!(
            relay
                .metrics()
                .counter_get(names::BACKEND_ERRORS, &[("kind", "overloaded")]),
            1
        );
    }

    #[tokio::test]
    async fn legacy_error_frames_look_like_content() {
        let source = Arc::new(MockSource::new(vec![MockResponse::stream_error(
            &[],
            BackendError::AuthenticationFailed("bad key".into()),
        )]));
        let registry = Arc::new(ScriptedRegistry::default());
        let relay = service(source, registry.clone()).with_options(SessionOptions {
            error_frames: ErrorFrameStyle::Legacy,
            ..Default::default()
        });

        let outcome = relay.session(request("Hello")).run().await;

        assert_eq!(outcome, SessionOutcome::Failed);
        assert_eq!(
            registry.frames(),
            vec![
                r#"{"message":"Error: authentication failed: bad key"}"#,
                r#"{"type":"done"}"#,
            ]
        );
    }

    #[tokio::test]
    async fn gone_connection_stops_quietly() {
        let source = Arc::new(MockSource::new(vec![MockResponse::stream_text(&["a", "b", "c"])]));
        let registry = Arc::new(ScriptedRegistry::gone_at(1));
        let relay = service(source, registry.clone());

        let outcome = relay.session(request("Hello")).run().await;

        assert_eq!(outcome, SessionOutcome::Gone);
        assert_eq!(registry.frames(), vec![r#"{"message":"a"}"#]);
        // No further pushes after the Gone, and no done marker
        assert_eq!(registry.attempts(), 2);
        assert_eq!(relay.metrics().counter_get(names::CONNECTIONS_GONE, &[]), 1);
    }

    #[tokio::test]
    async fn other_push_failures_do_not_stop_the_stream() {
        let source = Arc::new(MockSource::new(vec![MockResponse::stream_text(&["a", "b"])]));
        let registry = Arc::new(ScriptedRegistry::reject_at(0));
        let relay = service(source, registry.clone());

        let outcome = relay.session(request("Hello")).run().await;

        assert_eq!(outcome, SessionOutcome::Completed);
        assert_eq!(registry.frames(), vec![r#"{"message":"b"}"#, r#"{"type":"done"}"#]);
        assert_eq!(relay.metrics().counter_get(names::PUSH_FAILURES, &[]), 1);
        assert_eq!(relay.metrics().counter_get(names::DELTAS_PUSHED, &[]), 1);
    }

    #[tokio::test]
    async fn stream_without_stop_still_gets_done() {
        let source = Arc::new(MockSource::new(vec![MockResponse::Stream(vec![
            StreamEvent::delta("partial"),
        ])]));
        let registry = Arc::new(ScriptedRegistry::default());
        let relay = service(source, registry.clone());

        let outcome = relay.session(request("Hello")).run().await;

        assert_eq!(outcome, SessionOutcome::Truncated);
        assert_eq!(
            registry.frames(),
            vec![r#"{"message":"partial"}"#, r#"{"type":"done"}"#]
        );
    }

    #[tokio::test]
    async fn empty_stream_pushes_only_done() {
        let source = Arc::new(MockSource::new(vec![MockResponse::Stream(vec![StreamEvent::Done])]));
        let registry = Arc::new(ScriptedRegistry::default());
        let relay = service(source, registry.clone());

        assert_eq!(relay.session(request("Hello")).run().await, SessionOutcome::Completed);
        assert_eq!(registry.frames(), vec![r#"{"type":"done"}"#]);
    }

    #[tokio::test]
    async fn citations_precede_done() {
        let source = Arc::new(MockSource::new(vec![MockResponse::stream_text(&["Rates rose."])]));
        let registry = Arc::new(ScriptedRegistry::default());
        let retriever = Arc::new(FixedRetriever(Ok(vec![
            RetrievalResult {
                text: "Rates rose in 2023.".into(),
                source_uri: "s3://kb/reports/rates.pdf".into(),
                score: 0.9,
            },
            RetrievalResult {
                text: "Unrelated.".into(),
                source_uri: "s3://kb/other.pdf".into(),
                score: 0.1,
            },
        ])));
        let relay = service(source.clone(), registry.clone()).with_retriever(retriever);

        let outcome = relay.session(request("Why?")).run().await;

        assert_eq!(outcome, SessionOutcome::Completed);
        let frames = registry.frames();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], r#"{"message":"Rates rose."}"#);
        let citation: serde_json::Value = serde_json::from_str(&frames[1]).unwrap();
        let block = citation["message"].as_str().unwrap();
        assert!(block.starts_with("\n\n📚 Sources\n"));
        assert!(block.contains("rates.pdf (https://kb.s3.amazonaws.com/reports/rates.pdf)"));
        assert!(!block.contains("other.pdf"));
        assert_eq!(frames[2], r#"{"type":"done"}"#);

        // The prompt sent upstream carries the relevant snippet only
        let sent = &source.prompts()[0];
        assert!(sent.contains("Rates rose in 2023."));
        assert!(sent.contains("Why?"));
        assert!(!sent.contains("Unrelated."));
    }

    #[tokio::test]
    async fn citations_are_skipped_after_an_error() {
        let source = Arc::new(MockSource::new(vec![MockResponse::stream_error(
            &[],
            BackendError::Overloaded,
        )]));
        let registry = Arc::new(ScriptedRegistry::default());
        let retriever = Arc::new(FixedRetriever(Ok(vec![RetrievalResult {
            text: "x".into(),
            source_uri: "s3://kb/a.pdf".into(),
            score: 0.9,
        }])));
        let relay = service(source, registry.clone()).with_retriever(retriever);

        relay.session(request("Why?")).run().await;

        let frames = registry.frames();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].contains(r#""type":"error""#));
        assert_eq!(frames[1], r#"{"type":"done"}"#);
    }

    #[tokio::test]
    async fn retrieval_failure_falls_back_to_plain_prompt() {
        let source = Arc::new(MockSource::new(vec![MockResponse::stream_text(&["ok"])]));
        let registry = Arc::new(ScriptedRegistry::default());
        let retriever = Arc::new(FixedRetriever(Err(BackendError::NetworkError("down".into()))));
        let relay = service(source.clone(), registry.clone()).with_retriever(retriever);

        let outcome = relay.session(request("Why?")).run().await;

        assert_eq!(outcome, SessionOutcome::Completed);
        assert_eq!(source.prompts(), vec!["Why?".to_string()]);
        assert_eq!(registry.frames(), vec![r#"{"message":"ok"}"#, r#"{"type":"done"}"#]);
    }

    #[tokio::test]
    async fn start_rejects_invalid_input_without_calling_source() {
        let source = Arc::new(MockSource::new(vec![]));
        let registry = Arc::new(ScriptedRegistry::default());
        let relay = service(source.clone(), registry.clone());

        let err = relay.start("Yb2Q=", "   ").unwrap_err();
        assert_eq!(err.status_code(), 400);
        let err = relay.start("", "Hello").unwrap_err();
        assert_eq!(err.status_code(), 400);

        relay.shutdown().await;
        assert_eq!(source.call_count(), 0);
        assert!(registry.frames().is_empty());
    }

    #[tokio::test]
    async fn start_runs_in_background() {
        let source = Arc::new(MockSource::new(vec![MockResponse::stream_text(&["Hi"])]));
        let registry = Arc::new(ScriptedRegistry::default());
        let relay = service(source, registry.clone());

        let accepted = relay.start("Yb2Q=", "Hello").unwrap();
        assert_eq!(accepted.connection_id.as_str(), "Yb2Q=");
        assert!(accepted.session_id.as_str().starts_with("sess_"));

        relay.shutdown().await;
        assert_eq!(registry.frames(), vec![r#"{"message":"Hi"}"#, r#"{"type":"done"}"#]);
        assert_eq!(relay.metrics().counter_get(names::SESSIONS_STARTED, &[]), 1);
        assert_eq!(
            relay
                .metrics()
                .counter_get(names::SESSIONS_FINISHED, &[("outcome", "completed")]),
            1
        );
    }

    #[tokio::test]
    async fn start_after_shutdown_is_internal_error() {
        let source = Arc::new(MockSource::new(vec![]));
        let relay = service(source, Arc::new(ScriptedRegistry::default()));

        relay.shutdown().await;
        let err = relay.start("Yb2Q=", "Hello").unwrap_err();
        assert!(matches!(err, RequestError::Internal(_)));
        assert_eq!(err.status_code(), 500);
    }
}

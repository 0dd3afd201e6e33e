use async_trait::async_trait;

use crate::stream::EventStream;

/// A prompt-completion backend that emits incremental output.
///
/// `open` never fails outright: a backend that cannot be reached yields a
/// single `StreamEvent::Error` and then ends. Each call is an independent
/// backend invocation.
#[async_trait]
pub trait ModelStreamSource: Send + Sync {
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    async fn open(&self, prompt: &str) -> EventStream;
}

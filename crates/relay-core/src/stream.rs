use std::pin::Pin;

use futures::Stream;

use crate::errors::BackendError;

/// Normalized events produced by a model stream source.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// One incremental fragment of generated text.
    Delta { text: String },
    /// The backend signalled the end of the answer.
    Done,
    /// The backend call failed; nothing follows.
    Error { error: BackendError },
}

impl StreamEvent {
    pub fn delta(text: impl Into<String>) -> Self {
        Self::Delta { text: text.into() }
    }

    pub fn error(error: BackendError) -> Self {
        Self::Error { error }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_events() {
        assert!(StreamEvent::Done.is_terminal());
        assert!(StreamEvent::error(BackendError::Overloaded).is_terminal());
        assert!(!StreamEvent::delta("hi").is_terminal());
    }
}

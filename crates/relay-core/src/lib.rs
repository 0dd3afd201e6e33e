pub mod config;
pub mod errors;
pub mod ids;
pub mod registry;
pub mod retrieval;
pub mod source;
pub mod stream;
pub mod wire;

pub use errors::{BackendError, PushError, RequestError};
pub use ids::{ConnectionId, SessionId};
pub use registry::ConnectionRegistry;
pub use source::ModelStreamSource;
pub use stream::{EventStream, StreamEvent};
pub use wire::{ErrorFrameStyle, OutboundMessage};

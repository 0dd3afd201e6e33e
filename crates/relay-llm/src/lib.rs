pub mod mock;
pub mod provider;
pub mod retrieval;
pub mod sse;

pub use mock::{MockResponse, MockSource};
pub use provider::AnthropicStreamSource;
pub use retrieval::HttpRetriever;

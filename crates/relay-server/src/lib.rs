pub mod connection;
pub mod handlers;
pub mod remote;
pub mod server;
pub mod session;

pub use connection::LocalRegistry;
pub use handlers::HandlerResponse;
pub use remote::HttpRegistry;
pub use server::{start, ServerConfig, ServerHandle};
pub use session::{Accepted, RelayService, RelaySession, SessionOptions, SessionOutcome};

use std::time::Duration;

/// Rejection of an inbound request before any session starts.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("missing key in request: {0}")]
    MissingField(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl RequestError {
    /// HTTP-style status reported to the immediate caller.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::MalformedRequest(_) | Self::MissingField(_) => 400,
            Self::Internal(_) => 500,
        }
    }
}

/// Typed error hierarchy for model backend calls.
/// Classification is informational: the relay surfaces every failure once and never retries.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum BackendError {
    // Fatal
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // Transient
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("backend overloaded")]
    Overloaded,
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::ServerError { .. }
                | Self::Overloaded
                | Self::NetworkError(_)
                | Self::StreamInterrupted(_)
                | Self::Timeout(_)
        )
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::Overloaded => "overloaded",
            Self::NetworkError(_) => "network_error",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::Timeout(_) => "timeout",
        }
    }

    /// Classify an HTTP status code into the appropriate error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            400 | 404 | 422 => Self::InvalidRequest(body),
            408 | 504 => Self::Timeout(Duration::ZERO),
            429 => Self::RateLimited { retry_after: None },
            529 => Self::Overloaded,
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}

/// Failure of a single push-to-connection call.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    /// The connection no longer exists on the gateway.
    #[error("connection gone")]
    Gone,
    #[error("push rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("push transport error: {0}")]
    Transport(String),
}

impl PushError {
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Gone)
    }
}

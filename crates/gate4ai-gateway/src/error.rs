use std::fmt::Display;

use thiserror::Error;

pub use crate::model::ErrorData;
use crate::model::ProtocolVersion;

impl Display for ErrorData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.0, self.message)?;
        if let Some(data) = &self.data {
            write!(f, "({})", data)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorData {}

/// Errors that terminate an upstream session before it reaches `Connected`,
/// or describe why a closed session can no longer be used.
///
/// Every waiter of `open()` observes the same value, so it travels behind an
/// `Arc`.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("failed to connect to SSE stream: {0}")]
    Connect(String),
    #[error("upstream rejected the SSE stream: HTTP {0}")]
    Rejected(u16),
    #[error("unexpected content type: {0:?}")]
    UnexpectedContentType(Option<String>),
    #[error("SSE stream ended before the endpoint event")]
    UnexpectedEndOfStream,
    #[error("malformed endpoint event: {0}")]
    Endpoint(#[from] url::ParseError),
    #[error("endpoint event without data")]
    EndpointWithoutData,
    #[error("initialize failed: {0}")]
    Initialize(ServiceError),
    #[error("unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(ProtocolVersion),
    #[error("session closed")]
    Closed,
    #[error("cancelled")]
    Cancelled,
    #[error("timed out waiting for the session to open")]
    OpenTimeout,
}

/// Errors surfaced to the caller of a single upstream request. The session
/// itself stays healthy unless the variant says otherwise.
#[derive(Error, Debug, Clone)]
pub enum ServiceError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected HTTP status: {0}")]
    Http(u16),
    #[error("error response: {0}")]
    ErrorResponse(ErrorData),
    #[error("request timed out")]
    Timeout,
    #[error("request cancelled")]
    Cancelled,
    #[error("session closed")]
    Closed,
    #[error("session not connected")]
    NotConnected,
    #[error("unexpected response shape: {0}")]
    UnexpectedResponse(String),
}

impl ServiceError {
    pub(crate) fn transport(error: reqwest::Error) -> Self {
        // reqwest errors embed the full upstream URL; keep the sanitized form
        Self::Transport(error.without_url().to_string())
    }

    pub(crate) fn decode(error: serde_json::Error) -> Self {
        Self::UnexpectedResponse(error.to_string())
    }
}

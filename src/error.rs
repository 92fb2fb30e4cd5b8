use thiserror::Error;

/// Failures surfaced by a transport for one connect or send attempt.
///
/// Decode-level problems never reach this level: malformed stream lines
/// are absorbed by the decoder. Cancellation is its own variant so callers
/// can distinguish an aborted transfer from a network failure.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("request timed out")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("no response from model")]
    NoResponse,

    #[error("api error: {0}")]
    Api(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransportError::Cancelled)
    }
}

//! Error types for notification senders

/// Errors from constructing or using a notifier.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0} not supported")]
    Unsupported(String),

    #[error("missing setting: {0}")]
    MissingSetting(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("unexpected response: {0}")]
    Response(String),
}

/// Result alias for notifier operations.
pub type Result<T> = std::result::Result<T, Error>;

//! Error types for pool and dispatch operations

use upstream::CallError;

/// Errors from pool and dispatch operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("accounts exhausted: {0}")]
    AccountsExhausted(String),

    #[error("credential store error: {0}")]
    Store(#[from] credential_store::Error),

    #[error("unrecoverable upstream error: {0}")]
    Unclassified(CallError),

    #[error("retry limit reached after {attempts} attempts: {last}")]
    RetryLimit { attempts: u32, last: CallError },

    #[error("deadline exceeded after {attempts} attempts")]
    DeadlineExceeded { attempts: u32 },

    #[error("call cancelled")]
    Cancelled,
}

impl Error {
    /// Label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::AccountsExhausted(_) => "accounts_exhausted",
            Error::Store(_) => "store",
            Error::Unclassified(_) => "unclassified",
            Error::RetryLimit { .. } => "retry_limit",
            Error::DeadlineExceeded { .. } => "deadline_exceeded",
            Error::Cancelled => "cancelled",
        }
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

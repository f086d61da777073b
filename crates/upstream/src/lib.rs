//! Outbound call contract for rate-limited multi-tenant APIs
//!
//! The dispatcher treats every outbound call as an opaque function of a
//! credential that either succeeds or fails with a `CallError`. The error's
//! `ErrorClass` drives the retry/failover decision:
//! - Connection / RateLimit / Api: wait, then retry on the same credential
//! - Auth / QuotaExhausted: mark the credential exhausted and rotate
//! - Unclassified: notify and give up

pub mod classify;

pub use classify::{classify_status, classify_transport, is_quota_exhausted};

/// Classification of a failed outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Transport-layer failure (connect refused, reset, timeout)
    Connection,
    /// Transient per-minute rate limit, retry on the same credential
    RateLimit,
    /// Credential rejected (401/403), rotate to the next credential
    Auth,
    /// Credential ran out of quota or billing, rotate to the next credential
    QuotaExhausted,
    /// Known API failure (5xx, malformed response), retry on the same credential
    Api,
    /// Anything else; never retried
    Unclassified,
}

impl ErrorClass {
    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorClass::Connection => "connection",
            ErrorClass::RateLimit => "rate_limit",
            ErrorClass::Auth => "auth",
            ErrorClass::QuotaExhausted => "quota_exhausted",
            ErrorClass::Api => "api",
            ErrorClass::Unclassified => "unclassified",
        }
    }

    /// Whether this class is handled by exhausting the credential and rotating.
    pub fn rotates_credential(&self) -> bool {
        matches!(self, ErrorClass::Auth | ErrorClass::QuotaExhausted)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A failed outbound call together with its classification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{class} error: {message}")]
pub struct CallError {
    pub class: ErrorClass,
    pub message: String,
}

impl CallError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Connection, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::RateLimit, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Auth, message)
    }

    pub fn api(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Api, message)
    }

    pub fn unclassified(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Unclassified, message)
    }

    /// Build a `CallError` from an HTTP error response.
    pub fn from_status(status: u16, body: &str) -> Self {
        Self::new(
            classify_status(status, body),
            format!("upstream returned {status}: {body}"),
        )
    }

    /// Build a `CallError` from a reqwest transport error.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        Self::new(classify_transport(err), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_classes() {
        assert!(ErrorClass::Auth.rotates_credential());
        assert!(ErrorClass::QuotaExhausted.rotates_credential());
        assert!(!ErrorClass::RateLimit.rotates_credential());
        assert!(!ErrorClass::Connection.rotates_credential());
        assert!(!ErrorClass::Api.rotates_credential());
        assert!(!ErrorClass::Unclassified.rotates_credential());
    }

    #[test]
    fn call_error_display_includes_class_and_message() {
        let err = CallError::rate_limit("slow down");
        assert_eq!(err.to_string(), "rate_limit error: slow down");
    }

    #[test]
    fn from_status_classifies() {
        let err = CallError::from_status(401, "invalid api key");
        assert_eq!(err.class, ErrorClass::Auth);
        assert!(err.message.contains("401"));
        assert!(err.message.contains("invalid api key"));
    }
}

//! Error classification for HTTP APIs
//!
//! Distinguishes transient rate limits (429 with a generic message) from
//! quota exhaustion (429 whose body reports the account is out of quota or
//! billing). Only quota exhaustion and credential rejection trigger rotation.

use crate::ErrorClass;

/// Quota exhaustion message patterns in 429 responses.
///
/// These indicate the credential itself is spent, not that the caller is
/// sending too fast.
const QUOTA_PATTERNS: &[&str] = &[
    "insufficient_quota",
    "exceeded your current quota",
    "billing hard limit",
    "billing_not_active",
    "account is not active",
];

/// Whether a response body reports an exhausted quota.
pub fn is_quota_exhausted(body: &str) -> bool {
    let lower = body.to_lowercase();
    QUOTA_PATTERNS.iter().any(|pattern| lower.contains(pattern))
}

/// Classify an upstream error by HTTP status and response body.
///
/// 401/403 are `Auth`. 429 is `QuotaExhausted` when the body matches a quota
/// pattern, otherwise `RateLimit`. 408 and 5xx are `Api` (retry on the same
/// credential). Any other 4xx is `Unclassified`: the request itself is wrong
/// and retrying will not help.
pub fn classify_status(status: u16, body: &str) -> ErrorClass {
    match status {
        401 | 403 => ErrorClass::Auth,
        429 if is_quota_exhausted(body) => ErrorClass::QuotaExhausted,
        429 => ErrorClass::RateLimit,
        408 | 409 => ErrorClass::Api,
        500..=599 => ErrorClass::Api,
        _ => ErrorClass::Unclassified,
    }
}

/// Classify a reqwest error that did not produce an HTTP response.
///
/// Connect failures, timeouts and failures while sending the request are
/// `Connection`. Body/decode failures are `Api`. Builder and redirect errors
/// are programming or configuration errors and stay `Unclassified`.
pub fn classify_transport(err: &reqwest::Error) -> ErrorClass {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        ErrorClass::Connection
    } else if err.is_body() || err.is_decode() {
        ErrorClass::Api
    } else if let Some(status) = err.status() {
        classify_status(status.as_u16(), "")
    } else {
        ErrorClass::Unclassified
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_429_insufficient_quota() {
        let body = r#"{"error":{"type":"insufficient_quota","message":"You exceeded your current quota"}}"#;
        assert_eq!(classify_status(429, body), ErrorClass::QuotaExhausted);
    }

    #[test]
    fn classify_429_billing_limit() {
        let body = r#"{"error":{"message":"Billing hard limit has been reached"}}"#;
        assert_eq!(classify_status(429, body), ErrorClass::QuotaExhausted);
    }

    #[test]
    fn classify_429_generic_is_rate_limit() {
        let body = r#"{"error":{"message":"Rate limit reached for requests per min"}}"#;
        assert_eq!(classify_status(429, body), ErrorClass::RateLimit);
    }

    #[test]
    fn classify_429_empty_body_is_rate_limit() {
        assert_eq!(classify_status(429, ""), ErrorClass::RateLimit);
    }

    #[test]
    fn quota_patterns_case_insensitive() {
        assert!(is_quota_exhausted("INSUFFICIENT_QUOTA"));
        assert!(!is_quota_exhausted("too many requests"));
    }

    #[test]
    fn classify_401_403_auth() {
        assert_eq!(classify_status(401, "unauthorized"), ErrorClass::Auth);
        assert_eq!(classify_status(403, "forbidden"), ErrorClass::Auth);
    }

    #[test]
    fn classify_5xx_api() {
        for status in [500, 502, 503, 504] {
            assert_eq!(classify_status(status, "oops"), ErrorClass::Api);
        }
        assert_eq!(classify_status(408, "request timeout"), ErrorClass::Api);
    }

    #[test]
    fn classify_other_4xx_unclassified() {
        assert_eq!(classify_status(400, "bad request"), ErrorClass::Unclassified);
        assert_eq!(classify_status(404, "no such model"), ErrorClass::Unclassified);
    }

    #[tokio::test]
    async fn transport_connect_refused_is_connection() {
        // Bind then drop a listener so the port is closed.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = reqwest::Client::new()
            .get(format!("http://{addr}/"))
            .send()
            .await
            .unwrap_err();
        assert_eq!(classify_transport(&err), ErrorClass::Connection);
    }
}

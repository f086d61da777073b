//! Retry, backoff and credential failover around one outbound call
//!
//! Per attempt:
//! - success → return the result
//! - Connection / RateLimit / Api → wait the class backoff, retry on the same credential
//! - Auth / QuotaExhausted → exhaust the credential, rebind the session, retry at once
//! - Unclassified → notify, propagate
//!
//! Waits count toward `RetryPolicy::max_retries`; rotations do not (each one
//! exhausts a credential, so the pool size bounds them). Pool exhaustion,
//! unclassified errors and the retry limit are notified before propagating.
//! A deadline or cancellation ends the call without notification.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use credential_store::Credential;
use notifier::{Message, Notifier};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use upstream::{CallError, ErrorClass};

use crate::error::{Error, Result};
use crate::pool::Pool;

/// Backoff durations and the cap on wait-based retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub connection_backoff: Duration,
    pub rate_limit_backoff: Duration,
    pub api_error_backoff: Duration,
    /// Maximum wait-and-retry cycles per call; `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            connection_backoff: Duration::from_secs(5),
            rate_limit_backoff: Duration::from_secs(15),
            api_error_backoff: Duration::from_secs(5),
            max_retries: Some(10),
        }
    }
}

impl RetryPolicy {
    /// Default backoffs with no retry cap.
    pub fn unbounded() -> Self {
        Self {
            max_retries: None,
            ..Self::default()
        }
    }

    /// Wait before retrying `class` on the same credential, if it is retried that way.
    pub fn backoff_for(&self, class: ErrorClass) -> Option<Duration> {
        match class {
            ErrorClass::Connection => Some(self.connection_backoff),
            ErrorClass::RateLimit => Some(self.rate_limit_backoff),
            ErrorClass::Api => Some(self.api_error_backoff),
            ErrorClass::Auth | ErrorClass::QuotaExhausted | ErrorClass::Unclassified => None,
        }
    }
}

/// Per-call bounds imposed by the caller.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub deadline: Option<Instant>,
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Wraps outbound calls with classification-driven retry and failover.
#[derive(Clone)]
pub struct Dispatcher {
    pool: Arc<Pool>,
    notifier: Option<Arc<dyn Notifier>>,
    policy: RetryPolicy,
}

impl Dispatcher {
    pub fn new(pool: Arc<Pool>) -> Self {
        Self {
            pool,
            notifier: None,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `work` for `session` with no deadline or cancellation.
    pub async fn execute<T, F, Fut>(&self, session: &str, work: F) -> Result<T>
    where
        F: FnMut(Credential) -> Fut,
        Fut: Future<Output = std::result::Result<T, CallError>>,
    {
        self.execute_with(session, &CallOptions::default(), work)
            .await
    }

    /// Run `work` for `session`, retrying and rotating credentials per policy.
    ///
    /// `work` receives the session's currently bound credential on every
    /// attempt. Calls for one session must not overlap; distinct sessions
    /// may run concurrently and share credentials.
    pub async fn execute_with<T, F, Fut>(
        &self,
        session: &str,
        options: &CallOptions,
        mut work: F,
    ) -> Result<T>
    where
        F: FnMut(Credential) -> Fut,
        Fut: Future<Output = std::result::Result<T, CallError>>,
    {
        let mut credential = match self.pool.credential_for(session).await {
            Ok(credential) => credential,
            Err(e) => return Err(self.fail(session, e).await),
        };
        let mut attempts = 0u32;
        let mut retries = 0u32;

        loop {
            attempts += 1;
            metrics::counter!("dispatch_attempts_total").increment(1);
            let err = match self
                .bounded(session, options, attempts, work(credential.clone()))
                .await?
            {
                Ok(value) => {
                    debug!(session, attempts, credential = %credential, "call succeeded");
                    return Ok(value);
                }
                Err(err) => err,
            };

            if err.class.rotates_credential() {
                warn!(
                    session,
                    credential = %credential,
                    reason = err.class.label(),
                    error = %err.message,
                    "credential rejected, rotating"
                );
                metrics::counter!("dispatch_rotations_total", "reason" => err.class.label())
                    .increment(1);
                credential = match self.pool.next(session, Some(&credential)).await {
                    Ok(next) => next,
                    Err(e) => return Err(self.fail(session, e).await),
                };
                continue;
            }

            let Some(delay) = self.policy.backoff_for(err.class) else {
                return Err(self.fail(session, Error::Unclassified(err)).await);
            };

            if self.policy.max_retries.is_some_and(|max| retries >= max) {
                return Err(self
                    .fail(session, Error::RetryLimit { attempts, last: err })
                    .await);
            }
            retries += 1;

            warn!(
                session,
                credential = %credential,
                reason = err.class.label(),
                wait_secs = delay.as_secs_f64(),
                retry = retries,
                error = %err.message,
                "call failed, retrying after backoff"
            );
            metrics::counter!("dispatch_retries_total", "reason" => err.class.label())
                .increment(1);
            self.bounded(session, options, attempts, tokio::time::sleep(delay))
                .await?;
        }
    }

    /// Race `fut` against the caller's deadline and cancellation token.
    async fn bounded<F: Future>(
        &self,
        session: &str,
        options: &CallOptions,
        attempts: u32,
        fut: F,
    ) -> Result<F::Output> {
        let deadline = async {
            match options.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        let cancelled = async {
            match &options.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => {
                info!(session, attempts, "call cancelled");
                metrics::counter!("dispatch_failures_total", "kind" => Error::Cancelled.kind())
                    .increment(1);
                Err(Error::Cancelled)
            }
            _ = deadline => {
                let err = Error::DeadlineExceeded { attempts };
                info!(session, attempts, "call deadline exceeded");
                metrics::counter!("dispatch_failures_total", "kind" => err.kind()).increment(1);
                Err(err)
            }
            out = fut => Ok(out),
        }
    }

    /// Log, count and notify a terminal error, then hand it back.
    ///
    /// A failing notifier is logged; `err` is always handed back unchanged.
    async fn fail(&self, session: &str, err: Error) -> Error {
        error!(session, kind = err.kind(), error = %err, "call failed permanently");
        metrics::counter!("dispatch_failures_total", "kind" => err.kind()).increment(1);

        if let Some(notifier) = &self.notifier {
            let message = Message::from(format!("session {session}: {err}"));
            if let Err(e) = notifier.send(&message).await {
                warn!(
                    session,
                    notifier = notifier.name(),
                    error = %e,
                    "failed to send notification"
                );
            }
        }
        err
    }
}

//! Round-robin credential rotation with durable exhaustion
//!
//! The pool holds the candidate credentials (loaded once, file order), a
//! cursor, the session → credential bindings, and the exhausted key set.
//!
//! Locking:
//! - `rotation` (cursor + bindings) serializes every `next()`
//! - `exhaustion` serializes exhausted-log appends and the audit list
//! - `exhausted_keys` is a short-lived read/write lock over the key set
//!
//! `next()` may take `exhaustion` while holding `rotation`; nothing takes
//! `rotation` while holding `exhaustion`, so the two cannot deadlock. A
//! failover `next(session, Some(previous))` keeps `rotation` held across the
//! durable append, so other sessions' rotations wait for that write. Only a
//! standalone `mark_exhausted` appends without taking `rotation`, and the key
//! set stays readable during its write. Combined invariant: a key is
//! inserted into the set before its log line is written, and once inserted it
//! is never handed out by a later scan.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock, RwLockReadGuard};

use credential_store::Credential;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// Files backing a pool and an optional cap on usable credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub candidate_file: PathBuf,
    pub exhausted_file: PathBuf,
    /// Keep only the first `limit` usable credentials. `None` or `Some(0)` = no cap.
    pub limit: Option<usize>,
}

impl PoolConfig {
    pub fn new(candidate_file: impl Into<PathBuf>, exhausted_file: impl Into<PathBuf>) -> Self {
        Self {
            candidate_file: candidate_file.into(),
            exhausted_file: exhausted_file.into(),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Default)]
struct Rotation {
    cursor: usize,
    bindings: HashMap<String, Credential>,
}

#[derive(Debug)]
struct ExhaustionLog {
    path: PathBuf,
    /// Credentials exhausted by this process, in order.
    used: Vec<Credential>,
}

/// Credential pool shared by every session in the process.
pub struct Pool {
    config: PoolConfig,
    candidates: Vec<Credential>,
    rotation: Mutex<Rotation>,
    exhaustion: Mutex<ExhaustionLog>,
    exhausted_keys: RwLock<HashSet<String>>,
}

impl Pool {
    /// Load both credential files and build the pool.
    ///
    /// Candidates already present in the exhausted log are dropped before the
    /// `limit` cap is applied.
    pub async fn load(config: PoolConfig) -> Result<Self> {
        let loaded =
            credential_store::load(&config.candidate_file, &config.exhausted_file).await?;
        let mut candidates = loaded.candidates;
        if let Some(limit) = config.limit.filter(|l| *l > 0) {
            candidates.truncate(limit);
        }

        let pool = Self {
            exhaustion: Mutex::new(ExhaustionLog {
                path: config.exhausted_file.clone(),
                used: Vec::new(),
            }),
            config,
            candidates,
            rotation: Mutex::new(Rotation::default()),
            exhausted_keys: RwLock::new(loaded.exhausted),
        };
        let available = pool.available_count();
        metrics::gauge!("pool_available_credentials").set(available as f64);
        info!(
            candidates = pool.candidates.len(),
            available, "credential pool initialized"
        );
        Ok(pool)
    }

    /// Configuration this pool was loaded from.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Candidate credentials in rotation order.
    pub fn candidates(&self) -> &[Credential] {
        &self.candidates
    }

    /// Select the next unexhausted credential for `session` and bind it.
    ///
    /// When `previous` is given it is exhausted first: the session's current
    /// credential has run out. The scan starts at the cursor, wraps, and
    /// covers each candidate at most once; if none is usable the call fails
    /// with `AccountsExhausted` instead of spinning.
    pub async fn next(&self, session: &str, previous: Option<&Credential>) -> Result<Credential> {
        let mut rotation = self.rotation.lock().await;
        self.next_locked(&mut rotation, session, previous).await
    }

    /// The credential bound to `session`, binding one on first use.
    pub async fn credential_for(&self, session: &str) -> Result<Credential> {
        let mut rotation = self.rotation.lock().await;
        if let Some(bound) = rotation.bindings.get(session) {
            return Ok(bound.clone());
        }
        self.next_locked(&mut rotation, session, None).await
    }

    async fn next_locked(
        &self,
        rotation: &mut Rotation,
        session: &str,
        previous: Option<&Credential>,
    ) -> Result<Credential> {
        if let Some(previous) = previous {
            self.mark_exhausted(previous).await?;
        }

        let available = self.available_count();
        if available == 0 {
            info!(session, "all credentials exhausted");
        } else {
            debug!(session, available, "selecting credential");
        }

        let n = self.candidates.len();
        let start = rotation.cursor;
        let found = {
            let exhausted = self.read_keys();
            (0..n)
                .map(|offset| (start + offset) % n)
                .find(|idx| !exhausted.contains(self.candidates[*idx].identity()))
        };

        let Some(idx) = found else {
            return Err(Error::AccountsExhausted(self.exhausted_message()));
        };

        rotation.cursor = (idx + 1) % n;
        let selected = self.candidates[idx].clone();
        rotation
            .bindings
            .insert(session.to_string(), selected.clone());

        match previous {
            Some(previous) => info!(
                session,
                previous = %previous,
                next = %selected,
                reason = "exhausted",
                "session rotated to next credential"
            ),
            None => info!(session, credential = %selected, "session bound to first credential"),
        }
        Ok(selected)
    }

    /// Record `credential` as exhausted and append it to the durable log.
    ///
    /// Idempotent: returns `false` without touching the log when the key is
    /// already exhausted. If the append fails the key stays exhausted in
    /// memory and the error is returned.
    pub async fn mark_exhausted(&self, credential: &Credential) -> Result<bool> {
        let mut log = self.exhaustion.lock().await;

        let newly = self
            .exhausted_keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(credential.identity().to_string());
        if !newly {
            debug!(credential = %credential, "credential already exhausted");
            return Ok(false);
        }

        log.used.push(credential.clone());
        let available = self.available_count();
        metrics::gauge!("pool_available_credentials").set(available as f64);

        if let Err(e) = credential_store::append(log.path.clone(), credential.clone()).await {
            error!(credential = %credential, error = %e, "failed to persist exhausted credential");
            return Err(e.into());
        }
        warn!(credential = %credential, available, "credential exhausted");
        Ok(true)
    }

    /// Candidates not yet exhausted. Observability only.
    pub fn available_count(&self) -> usize {
        let exhausted = self.read_keys();
        self.candidates
            .iter()
            .filter(|c| !exhausted.contains(c.identity()))
            .count()
    }

    /// Whether `credential`'s key is exhausted.
    pub fn is_exhausted(&self, credential: &Credential) -> bool {
        self.read_keys().contains(credential.identity())
    }

    /// Credential currently bound to `session`, if any.
    pub async fn bound(&self, session: &str) -> Option<Credential> {
        self.rotation.lock().await.bindings.get(session).cloned()
    }

    /// Drop the binding of a finished session.
    pub async fn end_session(&self, session: &str) {
        if self.rotation.lock().await.bindings.remove(session).is_some() {
            debug!(session, "session binding released");
        }
    }

    /// Number of sessions with a bound credential.
    pub async fn session_count(&self) -> usize {
        self.rotation.lock().await.bindings.len()
    }

    /// Credentials exhausted by this process, in order.
    pub async fn exhausted_this_run(&self) -> Vec<Credential> {
        self.exhaustion.lock().await.used.clone()
    }

    /// Pool health snapshot.
    ///
    /// Status mapping: all available → healthy, some available → degraded,
    /// none available → unhealthy.
    pub async fn health(&self) -> serde_json::Value {
        let sessions = self.session_count().await;
        let total = self.candidates.len();
        let available = self.available_count();
        let status = if available == total && total > 0 {
            "healthy"
        } else if available > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "credentials_total": total,
            "credentials_available": available,
            "credentials_exhausted": total - available,
            "sessions_bound": sessions,
        })
    }

    fn read_keys(&self) -> RwLockReadGuard<'_, HashSet<String>> {
        self.exhausted_keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Build the exhausted error message JSON.
    fn exhausted_message(&self) -> String {
        let total = self.candidates.len();
        let available = self.available_count();
        serde_json::json!({
            "error": {
                "type": "accounts_exhausted",
                "message": "All credentials exhausted",
                "pool": {
                    "credentials_total": total,
                    "credentials_available": available,
                    "credentials_exhausted": total - available,
                }
            }
        })
        .to_string()
    }
}

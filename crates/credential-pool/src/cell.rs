//! Construct-once holder for the process pool
//!
//! A `PoolCell` loads its pool on the first `get_or_load` and returns the
//! same `Arc<Pool>` to every later caller without touching the files again,
//! whatever config they pass. Callers own the cell (usually created once at
//! startup and shared by reference); `global()` offers a process-wide one.

use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::warn;

use crate::error::Result;
use crate::pool::{Pool, PoolConfig};

static GLOBAL: PoolCell = PoolCell::new();

/// Process-wide pool cell.
pub fn global() -> &'static PoolCell {
    &GLOBAL
}

/// One-time initialization guard around a `Pool`.
pub struct PoolCell {
    cell: OnceCell<Arc<Pool>>,
}

impl PoolCell {
    pub const fn new() -> Self {
        Self {
            cell: OnceCell::const_new(),
        }
    }

    /// Return the pool, loading it from `config` if this is the first call.
    ///
    /// Concurrent first callers wait for a single load. A failed load leaves
    /// the cell empty so a later call can retry. Once loaded, a different
    /// `config` is ignored with a warning: reconfiguring is not supported.
    pub async fn get_or_load(&self, config: PoolConfig) -> Result<Arc<Pool>> {
        let pool = self
            .cell
            .get_or_try_init(|| async { Pool::load(config.clone()).await.map(Arc::new) })
            .await?;

        if pool.config() != &config {
            warn!(
                loaded_from = %pool.config().candidate_file.display(),
                requested = %config.candidate_file.display(),
                "credential pool already constructed, ignoring new configuration"
            );
        }
        Ok(pool.clone())
    }

    /// The pool, if already loaded.
    pub fn get(&self) -> Option<Arc<Pool>> {
        self.cell.get().cloned()
    }
}

impl Default for PoolCell {
    fn default() -> Self {
        Self::new()
    }
}

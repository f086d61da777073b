//! Credential rotation pool and retrying dispatcher
//!
//! Many concurrent sessions share a pool of API credentials. Each session is
//! bound to one credential at a time; many sessions may share a credential.
//! The pool hands credentials out round-robin and never hands out one that
//! has been exhausted, in this process or any earlier one (the exhausted log
//! is durable).
//!
//! Call lifecycle:
//! 1. `Dispatcher::execute` binds the session to a credential on first use
//! 2. The outbound call runs with the bound credential
//! 3. Connection / rate-limit / API failures wait and retry on the same credential
//! 4. Auth / quota failures exhaust the credential and rebind the session
//! 5. Unclassified failures and pool exhaustion are notified and propagated

pub mod cell;
pub mod dispatch;
pub mod error;
pub mod pool;

pub use cell::{PoolCell, global};
pub use credential_store::Credential;
pub use dispatch::{CallOptions, Dispatcher, RetryPolicy};
pub use error::{Error, Result};
pub use pool::{Pool, PoolConfig};
pub use tokio_util::sync::CancellationToken;

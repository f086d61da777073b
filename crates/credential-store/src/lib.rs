//! Durable credential files for the rotation pool
//!
//! Two plain-text files back the pool, one credential per line, fields joined
//! by `----`:
//! - the candidate file lists every credential that may be handed out
//! - the exhausted log is append-only and lists credentials that must never
//!   be handed out again
//!
//! `load` reads both and returns the usable candidates plus the exhausted key
//! set. `append` adds one credential to the exhausted log under an exclusive
//! `flock(2)` so concurrent processes never interleave partial lines.

pub mod credential;
pub mod error;
pub mod store;

pub use credential::{Credential, FIELD_SEPARATOR};
pub use error::{Error, Result};
pub use store::{Loaded, append, append_blocking, load};

//! Common types shared by the credential rotation crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;

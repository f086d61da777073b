//! Error types for credential file operations

use std::path::PathBuf;

/// Errors from loading or appending credential files.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to load {}: {reason}", path.display())]
    Load { path: PathBuf, reason: String },

    #[error("malformed record at {}:{line}: expected 3 or 4 fields, got {fields}", path.display())]
    Malformed {
        path: PathBuf,
        line: usize,
        fields: usize,
    },

    #[error("failed to append to {}: {reason}", path.display())]
    Append { path: PathBuf, reason: String },
}

impl Error {
    /// Path of the file that caused the error.
    pub fn path(&self) -> &std::path::Path {
        match self {
            Error::Load { path, .. } | Error::Malformed { path, .. } | Error::Append { path, .. } => {
                path
            }
        }
    }
}

/// Result alias for credential file operations.
pub type Result<T> = std::result::Result<T, Error>;

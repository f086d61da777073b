//! Loading the candidate file and exhausted log, appending to the log
//!
//! Loading is a pure function of file contents: neither file is modified.
//! Appending takes an exclusive `flock(2)` on the log for the duration of the
//! write, serializing writers across processes that share the same files.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::credential::Credential;
use crate::error::{Error, Result};

/// Result of loading both credential files.
#[derive(Debug, Default)]
pub struct Loaded {
    /// Usable candidates in file order, exhausted and duplicate keys removed.
    pub candidates: Vec<Credential>,
    /// Identity keys that must never be handed out.
    pub exhausted: HashSet<String>,
}

/// Load the candidate file and the exhausted log.
///
/// A missing exhausted log is a cold start and yields an empty set; it is
/// created on the first `append`. A log whose existence cannot be checked is
/// an error, never a cold start. A missing or unreadable candidate file is
/// an error. Any record whose field count is not 3 or 4 fails the load.
pub async fn load(candidate_file: &Path, exhausted_file: &Path) -> Result<Loaded> {
    let log_exists = tokio::fs::try_exists(exhausted_file)
        .await
        .map_err(|e| Error::Load {
            path: exhausted_file.to_path_buf(),
            reason: format!("checking exhausted log: {e}"),
        })?;
    let exhausted_records = if log_exists {
        let contents = read(exhausted_file).await?;
        parse_records(exhausted_file, &contents)?
    } else {
        info!(path = %exhausted_file.display(), "exhausted log not found, starting with none exhausted");
        Vec::new()
    };
    let exhausted: HashSet<String> = exhausted_records
        .iter()
        .map(|c| c.identity().to_string())
        .collect();

    let contents = read(candidate_file).await?;
    let all = parse_records(candidate_file, &contents)?;
    let total = all.len();

    let mut seen = HashSet::new();
    let mut candidates = Vec::with_capacity(total);
    for credential in all {
        if exhausted.contains(credential.identity()) {
            continue;
        }
        if !seen.insert(credential.identity().to_string()) {
            warn!(
                path = %candidate_file.display(),
                credential = %credential,
                "duplicate credential key, keeping first occurrence"
            );
            continue;
        }
        candidates.push(credential);
    }

    info!(
        candidates = candidates.len(),
        listed = total,
        exhausted = exhausted.len(),
        "loaded credentials"
    );
    Ok(Loaded {
        candidates,
        exhausted,
    })
}

async fn read(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::Load {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Parse every non-blank line of a credential file.
fn parse_records(path: &Path, contents: &str) -> Result<Vec<Credential>> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            Credential::parse(line).map_err(|fields| Error::Malformed {
                path: path.to_path_buf(),
                line: idx + 1,
                fields,
            })
        })
        .collect()
}

/// Append a credential to the exhausted log from async code.
///
/// The write and the blocking `flock` run on the blocking thread pool.
pub async fn append(path: PathBuf, credential: Credential) -> Result<()> {
    let join_path = path.clone();
    tokio::task::spawn_blocking(move || append_blocking(&path, &credential))
        .await
        .map_err(|e| Error::Append {
            path: join_path,
            reason: format!("append task failed: {e}"),
        })?
}

/// Append one line to the exhausted log while holding `LOCK_EX`.
///
/// The file is created with 0600 permissions (unix) if it does not exist.
pub fn append_blocking(path: &Path, credential: &Credential) -> Result<()> {
    let append_err = |reason: String| Error::Append {
        path: path.to_path_buf(),
        reason,
    };

    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let file = options
        .open(path)
        .map_err(|e| append_err(format!("opening log: {e}")))?;

    let _guard = ExclusiveLock::acquire(&file).map_err(|e| append_err(format!("flock: {e}")))?;

    let mut line = credential.to_line();
    line.push('\n');
    // Written through `&File` while the guard holds its shared borrow.
    (&file)
        .write_all(line.as_bytes())
        .map_err(|e| append_err(format!("writing record: {e}")))?;
    file.sync_data()
        .map_err(|e| append_err(format!("syncing log: {e}")))?;

    debug!(path = %path.display(), credential = %credential, "appended exhausted credential");
    Ok(())
}

/// Blocking exclusive advisory lock released on drop.
struct ExclusiveLock<'a> {
    #[cfg_attr(not(unix), allow(dead_code))]
    file: &'a File,
}

impl<'a> ExclusiveLock<'a> {
    #[cfg(unix)]
    fn acquire(file: &'a File) -> std::io::Result<Self> {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the fd is owned by `file`, which outlives this guard.
        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if ret != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self { file })
    }

    #[cfg(not(unix))]
    fn acquire(file: &'a File) -> std::io::Result<Self> {
        Ok(Self { file })
    }
}

impl Drop for ExclusiveLock<'_> {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: the fd is still owned by the borrowed `File`. Closing the
            // fd would release the lock too; unlocking here makes release
            // happen before the caller drops the file.
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}

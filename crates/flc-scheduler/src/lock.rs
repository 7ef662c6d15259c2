// SPDX-License-Identifier: MIT OR Apache-2.0
//! Process-level singleton enforcement.
//!
//! Two workers on one host sharing a lockfile path must not both run a
//! scheduler. The lock is an advisory, non-blocking exclusive file lock,
//! released when the guard drops (or the process exits).

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors from lock acquisition.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another process (or another scheduler in this one) holds the lock.
    #[error("lock held by another scheduler: {0}")]
    Held(PathBuf),

    /// The lockfile could not be created or opened.
    #[error("failed to open lockfile {path}: {source}")]
    Open {
        /// Lockfile path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The lock could not be acquired for a reason other than contention.
    #[error("failed to acquire lock on {path}: {source}")]
    Acquire {
        /// Lockfile path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Holds the exclusive advisory lock until dropped.
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    /// Acquire the lock at `path`, failing fast with [`LockError::Held`]
    /// when another holder exists.
    pub fn acquire(path: &Path) -> Result<LockGuard, LockError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| LockError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                debug!(target: "flc.scheduler", lockfile = %path.display(), "lock acquired");
                Ok(LockGuard {
                    file,
                    path: path.to_path_buf(),
                })
            }
            Err(err) => {
                let contended = fs2::lock_contended_error();
                if err.raw_os_error() == contended.raw_os_error() {
                    Err(LockError::Held(path.to_path_buf()))
                } else {
                    Err(LockError::Acquire {
                        path: path.to_path_buf(),
                        source: err,
                    })
                }
            }
        }
    }

    /// Lockfile path this guard holds.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        debug!(target: "flc.scheduler", lockfile = %self.path.display(), "lock released");
        let _ = FileExt::unlock(&self.file);
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("path", &self.path).finish()
    }
}

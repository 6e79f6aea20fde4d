//! Advisory cross-process locking.
//!
//! Wraps `flock` behind a small seam so the rest of the crate never touches
//! the primitive directly. The lock is exclusive and cooperative: only
//! participants that take it are excluded. Concurrent writers on different
//! hosts are not supported; this is a single-host mechanism.

use std::fs::OpenOptions;
use std::path::PathBuf;

use nix::fcntl::{Flock, FlockArg};

use super::IpcError;

pub struct LockFile {
    path: PathBuf,
}

/// Held for the duration of a critical section; dropping it releases the
/// advisory lock.
pub struct LockGuard {
    _flock: Flock<std::fs::File>,
}

impl LockFile {
    /// Create the lock file on disk (if missing) and return a handle to it.
    pub fn ensure(path: PathBuf) -> Result<Self, IpcError> {
        OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .map_err(IpcError::from)?;
        Ok(Self { path })
    }

    /// Handle to an existing lock file.
    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    /// Block until the exclusive lock is held.
    pub fn lock(&self) -> Result<LockGuard, IpcError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(IpcError::from)?;
        match Flock::lock(file, FlockArg::LockExclusive) {
            Ok(flock) => Ok(LockGuard { _flock: flock }),
            Err((_, errno)) => Err(IpcError::Lock(errno)),
        }
    }
}

//! Cooperative advisory file locks.
//!
//! Locks are taken with `flock(2)` in non-blocking mode and retried on a short
//! polling interval until a deadline passes. They are advisory: they only
//! exclude other processes that also lock the same file.

use crate::{Error, Result};
use rustix::fs::{FlockOperation, flock};
use rustix::io::Errno;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Default time to wait for a lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Default delay between lock attempts.
pub const DEFAULT_LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Bounds on lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Total time to wait before giving up.
    pub timeout: Duration,
    /// Delay between attempts.
    pub poll_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_LOCK_TIMEOUT,
            poll_interval: DEFAULT_LOCK_POLL_INTERVAL,
        }
    }
}

/// Lock flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Many readers.
    Shared,
    /// A single writer.
    Exclusive,
}

impl LockMode {
    const fn operation(self) -> FlockOperation {
        match self {
            Self::Shared => FlockOperation::NonBlockingLockShared,
            Self::Exclusive => FlockOperation::NonBlockingLockExclusive,
        }
    }
}

/// An open file holding an advisory lock.
///
/// The lock is released when the value is dropped.
#[derive(Debug)]
pub struct LockedFile {
    file: File,
    path: PathBuf,
}

impl LockedFile {
    /// Locks `file`, waiting at most `options.timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if the lock is still held elsewhere when
    /// the deadline passes, or [`Error::OperationFailed`] if `flock` fails for
    /// any other reason.
    pub fn acquire(file: File, path: &Path, mode: LockMode, options: LockOptions) -> Result<Self> {
        let start = Instant::now();

        loop {
            match flock(&file, mode.operation()) {
                Ok(()) => {
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    });
                },
                Err(errno) if errno == Errno::WOULDBLOCK || errno == Errno::INTR => {
                    let waited = start.elapsed();
                    if waited >= options.timeout {
                        metrics::counter!("cache_lock_timeout_total").increment(1);
                        return Err(Error::LockTimeout {
                            path: path.to_path_buf(),
                            waited,
                        });
                    }
                    std::thread::sleep(options.poll_interval.min(options.timeout - waited));
                },
                Err(errno) => {
                    return Err(Error::OperationFailed {
                        operation: "lock_cache_file".to_string(),
                        cause: format!("{}: {errno}", path.display()),
                    });
                },
            }
        }
    }

    /// Returns the locked file.
    pub fn file(&mut self) -> &mut File {
        &mut self.file
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        if let Err(errno) = flock(&self.file, FlockOperation::Unlock) {
            tracing::warn!(path = %self.path.display(), error = %errno, "Unable to unlock cache file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(path: &Path) -> File {
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .unwrap()
    }

    fn fast() -> LockOptions {
        LockOptions {
            timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_shared_locks_coexist() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry");

        let first = LockedFile::acquire(open(&path), &path, LockMode::Shared, fast());
        let second = LockedFile::acquire(open(&path), &path, LockMode::Shared, fast());
        assert!(first.is_ok());
        assert!(second.is_ok());
    }

    #[test]
    fn test_exclusive_lock_times_out() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry");

        let _held = LockedFile::acquire(open(&path), &path, LockMode::Exclusive, fast()).unwrap();
        let start = Instant::now();
        let result = LockedFile::acquire(open(&path), &path, LockMode::Shared, fast());

        assert!(matches!(result, Err(Error::LockTimeout { .. })));
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry");

        let held = LockedFile::acquire(open(&path), &path, LockMode::Exclusive, fast()).unwrap();
        drop(held);

        let result = LockedFile::acquire(open(&path), &path, LockMode::Exclusive, fast());
        assert!(result.is_ok());
    }
}

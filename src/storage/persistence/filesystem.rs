//! Filesystem-based metadata cache.
//!
//! Stores one JSON file per cache key under a base directory. File names are
//! the SHA-256 of the key, so repository paths containing `/` never escape the
//! base directory and every key maps to exactly one storage unit.
//!
//! # Locking
//!
//! Every read takes a shared `flock` on the entry file and every write takes an
//! exclusive one, each bounded by [`LockOptions`]. Concurrent invocations
//! sharing the directory therefore never observe a half-written entry. A lock
//! that cannot be acquired in time fails the operation with
//! [`Error::LockTimeout`].

use crate::models::ImageMetadata;
use crate::storage::lock::{LockMode, LockOptions, LockedFile};
use crate::storage::metrics::CacheOperation;
use crate::storage::traits::MetadataCache;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::instrument;

/// Maximum size of a cache entry file (64KB).
const MAX_FILE_SIZE: u64 = 64 * 1024;

/// Current on-disk entry format.
const FORMAT_VERSION: u32 = 1;

/// Serializable entry format for filesystem storage.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    version: u32,
    key: String,
    created_at: DateTime<Utc>,
    total_size_bytes: u64,
}

impl StoredEntry {
    fn new(key: &str, value: &ImageMetadata) -> Self {
        Self {
            version: FORMAT_VERSION,
            key: key.to_string(),
            created_at: value.created_at,
            total_size_bytes: value.total_size_bytes,
        }
    }

    const fn to_metadata(&self) -> ImageMetadata {
        ImageMetadata {
            created_at: self.created_at,
            total_size_bytes: self.total_size_bytes,
        }
    }
}

/// Filesystem-based metadata cache.
#[derive(Debug, Clone)]
pub struct FilesystemCache {
    /// Base directory for entries.
    base_path: PathBuf,
    /// Lock acquisition bounds.
    lock_options: LockOptions,
}

impl FilesystemCache {
    /// Opens a cache rooted at `base_path`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();

        fs::create_dir_all(&base_path).map_err(|e| Error::OperationFailed {
            operation: "create_cache_dir".to_string(),
            cause: format!("{}: {e}", base_path.display()),
        })?;

        Ok(Self {
            base_path,
            lock_options: LockOptions::default(),
        })
    }

    /// Overrides the lock acquisition bounds.
    #[must_use]
    pub const fn with_lock_options(mut self, lock_options: LockOptions) -> Self {
        self.lock_options = lock_options;
        self
    }

    /// Returns the file backing `key`.
    #[must_use]
    pub fn entry_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.base_path.join(format!("{}.cache", hex::encode(digest)))
    }

    /// Returns the base path.
    #[must_use]
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn read_entry(&self, key: &str, path: &Path) -> Result<Option<ImageMetadata>> {
        let file = match fs::File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::OperationFailed {
                    operation: "open_cache_entry".to_string(),
                    cause: format!("{}: {e}", path.display()),
                });
            },
        };

        let mut locked = LockedFile::acquire(file, path, LockMode::Shared, self.lock_options)?;

        let mut bytes = Vec::new();
        locked
            .file()
            .take(MAX_FILE_SIZE + 1)
            .read_to_end(&mut bytes)
            .map_err(|e| Error::OperationFailed {
                operation: "read_cache_entry".to_string(),
                cause: format!("{}: {e}", path.display()),
            })?;

        // A writer created the file but has not filled it yet.
        if bytes.is_empty() {
            return Ok(None);
        }

        if bytes.len() as u64 > MAX_FILE_SIZE {
            return Err(Error::CorruptEntry {
                key: key.to_string(),
                cause: format!("entry exceeds {MAX_FILE_SIZE} bytes"),
            });
        }

        let stored: StoredEntry =
            serde_json::from_slice(&bytes).map_err(|e| Error::CorruptEntry {
                key: key.to_string(),
                cause: e.to_string(),
            })?;

        if stored.key != key {
            return Err(Error::CorruptEntry {
                key: key.to_string(),
                cause: format!("entry belongs to '{}'", stored.key),
            });
        }

        Ok(Some(stored.to_metadata()))
    }

    fn write_entry(&self, key: &str, path: &Path, value: &ImageMetadata) -> Result<()> {
        let json = serde_json::to_vec(&StoredEntry::new(key, value)).map_err(|e| {
            Error::OperationFailed {
                operation: "serialize_cache_entry".to_string(),
                cause: e.to_string(),
            }
        })?;

        // Not truncated on open: the previous content stays intact until the
        // exclusive lock is held.
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(path)
            .map_err(|e| Error::OperationFailed {
                operation: "open_cache_entry".to_string(),
                cause: format!("{}: {e}", path.display()),
            })?;

        let mut locked = LockedFile::acquire(file, path, LockMode::Exclusive, self.lock_options)?;

        replace_contents(locked.file(), &json).map_err(|e| Error::OperationFailed {
            operation: "write_cache_entry".to_string(),
            cause: format!("{}: {e}", path.display()),
        })
    }
}

/// Replaces the whole content of an already locked file.
fn replace_contents(file: &mut fs::File, bytes: &[u8]) -> std::io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(bytes)?;
    file.sync_data()
}

impl MetadataCache for FilesystemCache {
    #[instrument(skip(self), fields(operation = "get", backend = "filesystem"))]
    fn get(&self, key: &str) -> Result<Option<ImageMetadata>> {
        let operation = CacheOperation::start("filesystem", "get");
        let path = self.entry_path(key);
        operation.finish(self.read_entry(key, &path))
    }

    #[instrument(skip(self, value), fields(operation = "set", backend = "filesystem"))]
    fn set(&self, key: &str, value: &ImageMetadata) -> Result<()> {
        let operation = CacheOperation::start("filesystem", "set");
        let path = self.entry_path(key);
        operation.finish(self.write_entry(key, &path, value))
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rustix::fs::{FlockOperation, flock};
    use std::time::Duration;
    use tempfile::TempDir;

    fn sample() -> ImageMetadata {
        ImageMetadata {
            created_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            total_size_bytes: 52_428_800,
        }
    }

    fn fast_locks() -> LockOptions {
        LockOptions {
            timeout: Duration::from_millis(150),
            poll_interval: Duration::from_millis(25),
        }
    }

    #[test]
    fn test_set_and_get() {
        let dir = TempDir::new().unwrap();
        let cache = FilesystemCache::new(dir.path()).unwrap();

        cache.set("team/app:v1", &sample()).unwrap();

        let retrieved = cache.get("team/app:v1").unwrap();
        assert_eq!(retrieved, Some(sample()));
    }

    #[test]
    fn test_get_unset_key_is_none() {
        let dir = TempDir::new().unwrap();
        let cache = FilesystemCache::new(dir.path()).unwrap();

        assert_eq!(cache.get("missing:v1").unwrap(), None);
    }

    #[test]
    fn test_overwrite_shorter_value() {
        let dir = TempDir::new().unwrap();
        let cache = FilesystemCache::new(dir.path()).unwrap();

        let large = ImageMetadata {
            total_size_bytes: u64::MAX,
            ..sample()
        };
        cache.set("app:v1", &large).unwrap();
        cache.set("app:v1", &sample()).unwrap();

        assert_eq!(cache.get("app:v1").unwrap(), Some(sample()));
    }

    #[test]
    fn test_entry_path_stays_in_base_dir() {
        let dir = TempDir::new().unwrap();
        let cache = FilesystemCache::new(dir.path()).unwrap();

        let path = cache.entry_path("../../etc/passwd:latest");
        assert_eq!(path.parent(), Some(dir.path()));
        assert_ne!(cache.entry_path("a:1"), cache.entry_path("a:2"));
    }

    #[test]
    fn test_corrupt_entry_is_distinct_from_missing() {
        let dir = TempDir::new().unwrap();
        let cache = FilesystemCache::new(dir.path()).unwrap();

        fs::write(cache.entry_path("app:v1"), b"not json").unwrap();

        let result = cache.get("app:v1");
        assert!(matches!(result, Err(Error::CorruptEntry { ref key, .. }) if key == "app:v1"));
    }

    #[test]
    fn test_empty_entry_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let cache = FilesystemCache::new(dir.path()).unwrap();

        fs::write(cache.entry_path("app:v1"), b"").unwrap();

        assert_eq!(cache.get("app:v1").unwrap(), None);
    }

    #[test]
    fn test_held_lock_times_out_get_and_set() {
        let dir = TempDir::new().unwrap();
        let cache = FilesystemCache::new(dir.path())
            .unwrap()
            .with_lock_options(fast_locks());
        cache.set("app:v1", &sample()).unwrap();

        let path = cache.entry_path("app:v1");
        let external = fs::File::open(&path).unwrap();
        flock(&external, FlockOperation::LockExclusive).unwrap();

        let read = cache.get("app:v1");
        assert!(matches!(read, Err(Error::LockTimeout { .. })));

        let write = cache.set("app:v1", &sample());
        assert!(matches!(write, Err(ref e) if e.is_cache_degradation()));

        flock(&external, FlockOperation::Unlock).unwrap();
        assert_eq!(cache.get("app:v1").unwrap(), Some(sample()));
    }

    #[test]
    fn test_shared_lock_blocks_writer_only() {
        let dir = TempDir::new().unwrap();
        let cache = FilesystemCache::new(dir.path())
            .unwrap()
            .with_lock_options(fast_locks());
        cache.set("app:v1", &sample()).unwrap();

        let path = cache.entry_path("app:v1");
        let reader = fs::File::open(&path).unwrap();
        flock(&reader, FlockOperation::LockShared).unwrap();

        assert_eq!(cache.get("app:v1").unwrap(), Some(sample()));
        assert!(matches!(
            cache.set("app:v1", &sample()),
            Err(Error::LockTimeout { .. })
        ));
    }

    #[test]
    fn test_entries_survive_reopen() {
        let dir = TempDir::new().unwrap();
        FilesystemCache::new(dir.path())
            .unwrap()
            .set("app:v1", &sample())
            .unwrap();

        let reopened = FilesystemCache::new(dir.path()).unwrap();
        assert_eq!(reopened.get("app:v1").unwrap(), Some(sample()));
    }

    #[test]
    fn test_new_creates_nested_dir() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");

        let cache = FilesystemCache::new(&nested).unwrap();
        assert!(nested.exists());
        assert_eq!(cache.base_path(), nested.as_path());
    }
}

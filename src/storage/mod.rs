//! Metadata cache storage.
//!
//! Two interchangeable backends implement [`MetadataCache`]:
//! - **Filesystem**: one JSON file per key, guarded by an advisory `flock`
//! - **`SQLite`**: a single `image_metadata` table with atomic upserts
//!
//! Exactly one backend is active per run, selected by [`CacheSettings`] and
//! opened once at startup through [`open_cache`].

// Dropping the connection guard slightly early buys nothing here.
#![allow(clippy::significant_drop_tightening)]

pub mod lock;
pub mod metrics;
pub mod persistence;
pub mod sqlite;
pub mod traits;

pub use lock::{LockMode, LockOptions, LockedFile};
pub use metrics::CacheOperation;
pub use persistence::{FilesystemCache, SqliteCache};
pub use traits::MetadataCache;

use crate::Result;
use crate::config::{CacheBackendKind, CacheSettings};
use std::sync::Arc;

/// Opens the cache backend selected by `settings`.
///
/// The filesystem backend stores entries directly under `settings.dir`; the
/// `SQLite` backend keeps a `cache.db` file there.
///
/// # Errors
///
/// Returns an error if the cache directory or database cannot be created.
pub fn open_cache(settings: &CacheSettings) -> Result<Arc<dyn MetadataCache>> {
    let cache: Arc<dyn MetadataCache> = match settings.backend {
        CacheBackendKind::Filesystem => Arc::new(
            FilesystemCache::new(&settings.dir)?.with_lock_options(settings.lock_options()),
        ),
        CacheBackendKind::Sqlite => Arc::new(SqliteCache::with_busy_timeout(
            settings.dir.join(persistence::DATABASE_FILE),
            settings.lock_timeout,
        )?),
    };

    tracing::debug!(
        backend = cache.backend_name(),
        dir = %settings.dir.display(),
        "Opened metadata cache"
    );
    Ok(cache)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ImageMetadata;
    use chrono::Utc;
    use tempfile::TempDir;

    fn settings(dir: &TempDir, backend: CacheBackendKind) -> CacheSettings {
        CacheSettings {
            backend,
            dir: dir.path().to_path_buf(),
            ..CacheSettings::default()
        }
    }

    #[test]
    fn test_open_filesystem_backend() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&settings(&dir, CacheBackendKind::Filesystem)).unwrap();
        assert_eq!(cache.backend_name(), "filesystem");
    }

    #[test]
    fn test_open_sqlite_backend_creates_database_file() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&settings(&dir, CacheBackendKind::Sqlite)).unwrap();
        assert_eq!(cache.backend_name(), "sqlite");

        let value = ImageMetadata {
            created_at: Utc::now(),
            total_size_bytes: 42,
        };
        cache.set("app:v1", &value).unwrap();
        assert!(dir.path().join("cache.db").exists());
        assert_eq!(cache.get("app:v1").unwrap(), Some(value));
    }
}

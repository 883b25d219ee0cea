//! `SQLite`-based metadata cache.
//!
//! Keeps every entry in a single `image_metadata` table keyed by the same
//! `repository:tag` string as the filesystem backend. Writes are atomic upserts,
//! so concurrent processes rely on `SQLite`'s own locking instead of a per-key
//! file lock. Waiting on another process is bounded by the busy timeout; an
//! exhausted wait surfaces as [`Error::LockTimeout`].

use crate::models::ImageMetadata;
use crate::storage::lock::DEFAULT_LOCK_TIMEOUT;
use crate::storage::metrics::CacheOperation;
use crate::storage::sqlite::{acquire_lock, configure_connection, is_busy};
use crate::storage::traits::MetadataCache;
use crate::{Error, Result};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::instrument;

/// Database file name inside the cache directory.
pub const DATABASE_FILE: &str = "cache.db";

/// `SQLite`-based metadata cache.
///
/// # Concurrency Model
///
/// The `Mutex<Connection>` only exists because `rusqlite::Connection` is not
/// `Sync`. Cross-process safety comes from `SQLite` transactions plus WAL mode.
pub struct SqliteCache {
    /// Connection to the `SQLite` database.
    conn: Mutex<Connection>,
    /// Path to the `SQLite` database (None for in-memory).
    db_path: Option<PathBuf>,
    /// Maximum wait for a lock held by another connection.
    busy_timeout: Duration,
}

impl SqliteCache {
    /// Opens (or creates) the cache database at `db_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self> {
        Self::with_busy_timeout(db_path, DEFAULT_LOCK_TIMEOUT)
    }

    /// Opens the cache database with an explicit lock wait bound.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn with_busy_timeout(db_path: impl Into<PathBuf>, busy_timeout: Duration) -> Result<Self> {
        let db_path = db_path.into();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::OperationFailed {
                operation: "create_cache_dir".to_string(),
                cause: format!("{}: {e}", parent.display()),
            })?;
        }

        tracing::debug!(path = %db_path.display(), "Opening cache database");
        let conn = Connection::open(&db_path).map_err(|e| Error::OperationFailed {
            operation: "open_sqlite".to_string(),
            cause: e.to_string(),
        })?;

        let cache = Self {
            conn: Mutex::new(conn),
            db_path: Some(db_path),
            busy_timeout,
        };

        cache.initialize()?;
        Ok(cache)
    }

    /// Creates an in-memory cache (useful for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::OperationFailed {
            operation: "open_sqlite_in_memory".to_string(),
            cause: e.to_string(),
        })?;

        let cache = Self {
            conn: Mutex::new(conn),
            db_path: None,
            busy_timeout: DEFAULT_LOCK_TIMEOUT,
        };

        cache.initialize()?;
        Ok(cache)
    }

    /// Returns the database path (None for in-memory).
    #[must_use]
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Creates the `image_metadata` table if it does not exist yet.
    fn initialize(&self) -> Result<()> {
        let conn = acquire_lock(&self.conn);

        configure_connection(&conn, self.busy_timeout)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS image_metadata (
                key TEXT NOT NULL PRIMARY KEY,
                data BLOB NOT NULL
            )",
            [],
        )
        .map_err(|e| self.map_error("create_cache_table", &e))?;

        Ok(())
    }

    /// Maps a `rusqlite` error, turning lock contention into a timeout.
    fn map_error(&self, operation: &str, error: &rusqlite::Error) -> Error {
        if is_busy(error) {
            return Error::LockTimeout {
                path: self
                    .db_path
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(":memory:")),
                waited: self.busy_timeout,
            };
        }
        Error::OperationFailed {
            operation: operation.to_string(),
            cause: error.to_string(),
        }
    }
}

impl MetadataCache for SqliteCache {
    #[instrument(skip(self), fields(operation = "get", backend = "sqlite"))]
    fn get(&self, key: &str) -> Result<Option<ImageMetadata>> {
        let operation = CacheOperation::start("sqlite", "get");
        let result = (|| -> Result<Option<ImageMetadata>> {
            let conn = acquire_lock(&self.conn);

            let data: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT data FROM image_metadata WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| self.map_error("get_cache_entry", &e))?;

            data.map(|bytes| {
                serde_json::from_slice::<ImageMetadata>(&bytes).map_err(|e| Error::CorruptEntry {
                    key: key.to_string(),
                    cause: e.to_string(),
                })
            })
            .transpose()
        })();

        operation.finish(result)
    }

    #[instrument(skip(self, value), fields(operation = "set", backend = "sqlite"))]
    fn set(&self, key: &str, value: &ImageMetadata) -> Result<()> {
        let operation = CacheOperation::start("sqlite", "set");
        let result = (|| -> Result<()> {
            let data = serde_json::to_vec(value).map_err(|e| Error::OperationFailed {
                operation: "serialize_cache_entry".to_string(),
                cause: e.to_string(),
            })?;

            let conn = acquire_lock(&self.conn);
            conn.execute(
                "INSERT INTO image_metadata (key, data) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET data = excluded.data",
                params![key, data],
            )
            .map_err(|e| self.map_error("upsert_cache_entry", &e))?;

            Ok(())
        })();

        operation.finish(result)
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

//! Metadata cache trait.

use crate::Result;
use crate::models::ImageMetadata;

/// Durable `repository:tag` → [`ImageMetadata`] store shared across runs.
///
/// Entries are written once and trusted indefinitely, so the contract has no
/// expiry, deletion or invalidation. Implementations must tolerate other
/// processes using the same store concurrently.
///
/// # Errors
///
/// [`Error::LockTimeout`](crate::Error::LockTimeout) and
/// [`Error::CorruptEntry`](crate::Error::CorruptEntry) mean the entry could
/// not be used safely; callers recompute the value as if it were missing.
pub trait MetadataCache: Send + Sync {
    /// Retrieves the metadata stored under `key`.
    ///
    /// Returns `Ok(None)` when nothing is stored.
    fn get(&self, key: &str) -> Result<Option<ImageMetadata>>;

    /// Stores `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &ImageMetadata) -> Result<()>;

    /// Short backend name for logs and metrics.
    fn backend_name(&self) -> &'static str;
}

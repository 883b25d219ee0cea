//! Cached image facts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Creation time and size of one `(repository, tag)`.
///
/// Tags are treated as content-stable: once computed, the value is cached and
/// trusted indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    /// Creation time recorded in the image config blob.
    pub created_at: DateTime<Utc>,
    /// Config blob size plus the size of every layer, in bytes.
    pub total_size_bytes: u64,
}

/// Manifest facts returned by the registry for a tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestMetadata {
    /// Content digest of the manifest, used for deletion.
    pub digest: String,
    /// Creation time recorded in the image config blob.
    pub created_at: DateTime<Utc>,
    /// Config blob size plus the size of every layer, in bytes.
    pub total_size_bytes: u64,
}

impl ManifestMetadata {
    /// Returns the cacheable part of the manifest facts.
    #[must_use]
    pub const fn metadata(&self) -> ImageMetadata {
        ImageMetadata {
            created_at: self.created_at,
            total_size_bytes: self.total_size_bytes,
        }
    }
}

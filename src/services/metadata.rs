//! Cache-then-registry image metadata lookup.

use crate::gc::MetadataLookup;
use crate::models::{ImageMetadata, ImageRef};
use crate::registry::RegistryInventorySource;
use crate::storage::MetadataCache;
use crate::Result;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Resolves image metadata from the cache, falling back to the registry.
///
/// A cache entry that cannot be used (lock timeout, corrupt data, I/O error)
/// is treated as a miss. Values fetched from the registry are written back;
/// a failed write only costs a registry round-trip on the next lookup.
pub struct MetadataService {
    cache: Arc<dyn MetadataCache>,
    registry: Arc<dyn RegistryInventorySource>,
}

impl MetadataService {
    /// Creates a new metadata service.
    #[must_use]
    pub fn new(cache: Arc<dyn MetadataCache>, registry: Arc<dyn RegistryInventorySource>) -> Self {
        Self { cache, registry }
    }

    /// Returns creation time and size for `image`.
    ///
    /// # Errors
    ///
    /// Returns the registry error if the value is not cached and cannot be
    /// fetched.
    #[instrument(skip(self), fields(operation = "get_metadata", image = %image))]
    pub fn get(&self, image: &ImageRef) -> Result<ImageMetadata> {
        let key = image.cache_key();
        let backend = self.cache.backend_name();

        match self.cache.get(&key) {
            Ok(Some(metadata)) => {
                metrics::counter!("metadata_cache_hits_total", "backend" => backend).increment(1);
                return Ok(metadata);
            },
            Ok(None) => {},
            Err(e) => {
                warn!(
                    key = %key,
                    error = %e,
                    contended_or_corrupt = e.is_cache_degradation(),
                    "Cache entry unusable, treating as miss"
                );
                metrics::counter!("metadata_cache_degraded_total", "backend" => backend)
                    .increment(1);
            },
        }
        metrics::counter!("metadata_cache_misses_total", "backend" => backend).increment(1);

        let metadata = self
            .registry
            .fetch_manifest_metadata(&image.repository, &image.tag)
            .inspect_err(|e| warn!(image = %image, error = %e, "Failed to fetch image metadata"))?
            .metadata();

        if let Err(e) = self.cache.set(&key, &metadata) {
            warn!(key = %key, error = %e, "Failed to cache image metadata");
        } else {
            debug!(key = %key, "Cached image metadata");
        }

        Ok(metadata)
    }
}

impl MetadataLookup for MetadataService {
    fn lookup(&self, image: &ImageRef) -> Result<ImageMetadata> {
        self.get(image)
    }
}

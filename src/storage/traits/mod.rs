//! Storage backend traits.

mod metadata_cache;

pub use metadata_cache::MetadataCache;

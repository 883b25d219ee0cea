//! # Regclean
//!
//! Deletes container registry images that no Kubernetes cluster is running.
//!
//! Regclean collects the images referenced by pods, replica sets and controller
//! revisions across one or more cluster contexts, lists every tag stored in a
//! registry, and removes the registry tags that are unreferenced, older than a
//! minimum age, and not protected by name filters.
//!
//! ## Pipeline
//!
//! 1. Normalize image references into `(host, repository, tag)` triples ([`ImageRef`])
//! 2. Reconcile registry inventory against cluster usage ([`gc::Reconciler`])
//! 3. Apply retention rules ([`gc::RetentionFilter`])
//! 4. Delete survivors with per-image outcomes ([`gc::DeletionOrchestrator`])
//!
//! Image creation times and sizes are cached across runs in a [`MetadataCache`]
//! (one file per key, or a single `SQLite` table).
//!
//! ## Example
//!
//! ```rust,ignore
//! use regclean::gc::Reconciler;
//! use regclean::ImageRef;
//!
//! let cluster = ImageRef::collect_unique(["reg.io/app:v1", "reg.io/app:v1"]);
//! let registry = ImageRef::collect_unique(["reg.io/app:v1", "reg.io/app:v2"]);
//! let result = Reconciler::reconcile(&cluster.into_iter().collect(), &registry);
//! assert_eq!(result.to_delete.len(), 1);
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error as ThisError;

pub mod cli;
pub mod cluster;
pub mod config;
pub mod gc;
pub mod models;
pub mod observability;
pub mod registry;
pub mod services;
pub mod storage;

pub use config::{CacheBackendKind, RegcleanConfig};
pub use models::{ImageMetadata, ImageRef, ManifestMetadata};
pub use registry::{CredentialResolver, Credentials, RegistryInventorySource};
pub use services::{CleanupService, CleanupSummary, MetadataService};
pub use storage::{FilesystemCache, MetadataCache, SqliteCache};

/// Error type for regclean operations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `InvalidInput` | Malformed config file, missing registry URL, bad flag values |
/// | `OperationFailed` | I/O errors, registry transport failures, `kubectl` failures |
/// | `NotFound` | Registry answered 404 for a manifest or blob |
/// | `Unauthorized` | Registry rejected the credentials |
/// | `LockTimeout` | A cache entry lock could not be taken in time |
/// | `CorruptEntry` | A cache entry could not be decoded |
/// | `Aborted` | The operator declined the blanket delete confirmation |
#[derive(Debug, ThisError)]
pub enum Error {
    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An operation failed.
    ///
    /// Registry transport errors surface here and are considered transient.
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// The registry reported that the requested object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Authentication against the registry failed.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The advisory lock guarding a cache entry was not acquired in time.
    #[error("timed out after {waited:?} waiting for lock on {}", path.display())]
    LockTimeout {
        /// Storage unit that could not be locked.
        path: PathBuf,
        /// How long the caller waited.
        waited: Duration,
    },

    /// A cache entry exists but cannot be decoded.
    #[error("corrupt cache entry '{key}': {cause}")]
    CorruptEntry {
        /// Cache key of the entry.
        key: String,
        /// Decoder error.
        cause: String,
    },

    /// The run was aborted by the operator.
    #[error("aborted: {0}")]
    Aborted(String),
}

impl Error {
    /// Returns `true` for a registry 404.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns `true` for cache failures that should be handled as a miss.
    #[must_use]
    pub const fn is_cache_degradation(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::CorruptEntry { .. })
    }
}

/// Result type alias for regclean operations.
pub type Result<T> = std::result::Result<T, Error>;

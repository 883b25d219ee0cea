//! Registry garbage collection.
//!
//! This module decides which registry images to delete and carries the
//! deletions out:
//!
//! 1. [`Reconciler`] splits the registry inventory into images still running
//!    in some cluster and unreferenced candidates
//! 2. [`RetentionFilter`] protects candidates by name or by age
//! 3. [`DeletionOrchestrator`] deletes the survivors, one outcome per image
//!
//! # Example
//!
//! ```rust,ignore
//! use regclean::gc::{DeletionOptions, DeletionOrchestrator, Reconciler, RetentionFilter};
//!
//! let result = Reconciler::reconcile(&cluster_images, &registry_images);
//! let outcome = RetentionFilter::new(config).filter(result.to_delete, &metadata);
//!
//! let options = DeletionOptions { dry_run: true, yolo: false };
//! let records = DeletionOrchestrator::new(&registry, &prompt, options)
//!     .execute(&outcome.survivors)?;
//! ```

mod deletion;
mod reconcile;
mod retention;

pub use deletion::{
    BLANKET_CONFIRMATION, DeletionOptions, DeletionOrchestrator, DeletionOutcome, DeletionRecord,
};
pub use reconcile::{ReconciliationResult, Reconciler};
pub use retention::{
    DEFAULT_MIN_AGE_DAYS, FilterOutcome, FilterReason, FilterStats, MetadataLookup,
    RetentionFilter, RetentionFilterConfig,
};

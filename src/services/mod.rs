//! Business logic services.
//!
//! Services wire the collaborators together: [`MetadataService`] puts the
//! metadata cache in front of the registry, and [`CleanupService`] runs the
//! whole cleanup pipeline.

mod cleanup;
mod metadata;

pub use cleanup::{CleanupOptions, CleanupPlan, CleanupService, CleanupSummary};
pub use metadata::MetadataService;

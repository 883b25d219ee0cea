//! Per-image deletion with confirmation and outcome tracking.

use crate::cli::Confirm;
use crate::models::ImageRef;
use crate::registry::RegistryInventorySource;
use crate::{Error, Result};
use tracing::{info, instrument, warn};

/// Question asked once before deleting without per-image confirmation.
pub const BLANKET_CONFIRMATION: &str = "We will delete all without asking, are you sure?";

/// What happened to one deletion candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletionOutcome {
    /// The manifest was deleted.
    Deleted {
        /// Digest of the deleted manifest.
        digest: String,
    },
    /// Dry run: the manifest would have been deleted.
    WouldDelete {
        /// Digest the tag currently points to.
        digest: String,
    },
    /// The operator declined to delete the image.
    Skipped,
    /// Digest resolution or deletion failed.
    Failed(String),
}

impl DeletionOutcome {
    /// Short outcome name for reports and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Deleted { .. } => "deleted",
            Self::WouldDelete { .. } => "would_delete",
            Self::Skipped => "skipped",
            Self::Failed(_) => "failed",
        }
    }
}

/// Outcome for a single candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionRecord {
    /// The candidate image.
    pub image: ImageRef,
    /// What happened to it.
    pub outcome: DeletionOutcome,
}

/// How deletions are carried out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeletionOptions {
    /// Resolve digests and report, but never delete.
    pub dry_run: bool,
    /// Skip per-image confirmation after one blanket confirmation. The
    /// blanket confirmation is asked in dry runs too.
    pub yolo: bool,
}

/// Deletes candidates one at a time, recording an outcome for each.
///
/// A failure on one image never stops the batch.
pub struct DeletionOrchestrator<'a> {
    registry: &'a dyn RegistryInventorySource,
    confirm: &'a dyn Confirm,
    options: DeletionOptions,
}

impl<'a> DeletionOrchestrator<'a> {
    /// Creates an orchestrator.
    #[must_use]
    pub const fn new(
        registry: &'a dyn RegistryInventorySource,
        confirm: &'a dyn Confirm,
        options: DeletionOptions,
    ) -> Self {
        Self {
            registry,
            confirm,
            options,
        }
    }

    /// Processes `candidates` in order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Aborted`] if the blanket confirmation is declined (no
    /// image is touched in that case), or an error if a prompt cannot be read.
    #[instrument(
        name = "regclean.gc.delete",
        skip(self, candidates),
        fields(
            component = "gc",
            operation = "delete",
            candidates = candidates.len(),
            dry_run = self.options.dry_run,
            yolo = self.options.yolo
        )
    )]
    pub fn execute(&self, candidates: &[ImageRef]) -> Result<Vec<DeletionRecord>> {
        if self.options.yolo
            && !candidates.is_empty()
            && !self.confirm.confirm(BLANKET_CONFIRMATION)?
        {
            return Err(Error::Aborted("Back to safety".to_string()));
        }

        let mut records = Vec::with_capacity(candidates.len());
        for image in candidates {
            let outcome = self.process(image)?;
            metrics::counter!("regclean_deletion_outcomes_total", "outcome" => outcome.as_str())
                .increment(1);
            records.push(DeletionRecord {
                image: image.clone(),
                outcome,
            });
        }

        Ok(records)
    }

    fn process(&self, image: &ImageRef) -> Result<DeletionOutcome> {
        let digest = match self.registry.manifest_digest(&image.repository, &image.tag) {
            Ok(digest) => digest,
            Err(e) => {
                warn!(image = %image, error = %e, "Failed to fetch digest");
                return Ok(DeletionOutcome::Failed(format!("failed to fetch digest: {e}")));
            },
        };

        if self.options.dry_run {
            info!(image = %image, digest = %digest, "Dry run, skipping delete on registry");
            return Ok(DeletionOutcome::WouldDelete { digest });
        }

        if !self.options.yolo && !self.confirm.confirm(&format!("Delete {image}?"))? {
            return Ok(DeletionOutcome::Skipped);
        }

        warn!(image = %image, digest = %digest, "Deleting manifest on registry");
        match self.registry.delete_manifest(&image.repository, &digest) {
            Ok(()) => {
                metrics::counter!("regclean_images_deleted_total").increment(1);
                Ok(DeletionOutcome::Deleted { digest })
            },
            Err(e) => {
                warn!(image = %image, digest = %digest, error = %e, "Failed to delete manifest");
                Ok(DeletionOutcome::Failed(format!("failed to delete manifest: {e}")))
            },
        }
    }
}

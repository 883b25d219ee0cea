//! End-to-end registry cleanup.
//!
//! [`CleanupService::plan`] gathers cluster usage and registry inventory and
//! decides what to delete; [`CleanupService::execute`] carries the plan out.
//! [`CleanupService::run`] does both.

use super::MetadataService;
use crate::cli::Confirm;
use crate::cluster::ClusterImageSource;
use crate::gc::{
    DeletionOptions, DeletionOrchestrator, DeletionOutcome, DeletionRecord, FilterStats,
    Reconciler, RetentionFilter, RetentionFilterConfig,
};
use crate::models::ImageRef;
use crate::registry::RegistryInventorySource;
use crate::storage::MetadataCache;
use crate::Result;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, trace};

/// What a cleanup run should do.
#[derive(Debug, Clone, Default)]
pub struct CleanupOptions {
    /// Cluster contexts to scan. Empty scans the current context.
    pub contexts: Vec<String>,
    /// Retention rules for unreferenced images.
    pub retention: RetentionFilterConfig,
    /// Dry-run and confirmation behavior.
    pub deletion: DeletionOptions,
}

/// Deletion candidates and the facts that led to them.
#[derive(Debug, Clone, Default)]
pub struct CleanupPlan {
    /// Distinct images in the registry.
    pub considered: usize,
    /// Registry images referenced by a cluster.
    pub in_use: Vec<ImageRef>,
    /// Images that will be deleted, in registry order.
    pub candidates: Vec<ImageRef>,
    /// Why unreferenced images were protected.
    pub filtered: FilterStats,
    /// Combined size of the candidates whose size is known.
    pub reclaimable_bytes: u64,
}

impl CleanupPlan {
    /// Images that stay: referenced ones plus those protected by retention.
    #[must_use]
    pub const fn kept(&self) -> usize {
        self.in_use.len() + self.filtered.total()
    }
}

/// Result of a cleanup run.
#[derive(Debug, Clone, Default)]
pub struct CleanupSummary {
    /// Distinct images in the registry.
    pub considered: usize,
    /// Images kept (referenced or protected).
    pub kept: usize,
    /// Per-rule breakdown of protected images.
    pub filtered: FilterStats,
    /// Images deleted.
    pub deleted: usize,
    /// Images that a real run would delete.
    pub would_delete: usize,
    /// Images the operator declined to delete.
    pub skipped: usize,
    /// Images whose deletion failed.
    pub failed: usize,
    /// Combined size of the deletion candidates.
    pub reclaimable_bytes: u64,
    /// Whether this was a dry run.
    pub dry_run: bool,
    /// Outcome for each candidate, in order.
    pub outcomes: Vec<DeletionRecord>,
}

impl CleanupSummary {
    fn from_plan(plan: &CleanupPlan, dry_run: bool) -> Self {
        Self {
            considered: plan.considered,
            kept: plan.kept(),
            filtered: plan.filtered,
            reclaimable_bytes: plan.reclaimable_bytes,
            dry_run,
            ..Self::default()
        }
    }

    fn record(&mut self, records: Vec<DeletionRecord>) {
        for record in &records {
            match record.outcome {
                DeletionOutcome::Deleted { .. } => self.deleted += 1,
                DeletionOutcome::WouldDelete { .. } => self.would_delete += 1,
                DeletionOutcome::Skipped => self.skipped += 1,
                DeletionOutcome::Failed(_) => self.failed += 1,
            }
        }
        self.outcomes = records;
    }
}

/// Runs the full reconcile, filter and delete pipeline.
pub struct CleanupService {
    cluster: Arc<dyn ClusterImageSource>,
    registry: Arc<dyn RegistryInventorySource>,
    metadata: MetadataService,
    confirm: Arc<dyn Confirm>,
    options: CleanupOptions,
}

impl CleanupService {
    /// Creates a cleanup service.
    ///
    /// The cache is opened by the caller and shared for the whole run.
    #[must_use]
    pub fn new(
        cluster: Arc<dyn ClusterImageSource>,
        registry: Arc<dyn RegistryInventorySource>,
        cache: Arc<dyn MetadataCache>,
        confirm: Arc<dyn Confirm>,
        options: CleanupOptions,
    ) -> Self {
        let metadata = MetadataService::new(cache, Arc::clone(&registry));
        Self {
            cluster,
            registry,
            metadata,
            confirm,
            options,
        }
    }

    /// Collects the distinct images running across the configured contexts.
    ///
    /// # Errors
    ///
    /// Returns an error if any context cannot be queried.
    pub fn cluster_images(&self) -> Result<HashSet<ImageRef>> {
        let contexts: Vec<Option<&str>> = if self.options.contexts.is_empty() {
            vec![None]
        } else {
            self.options.contexts.iter().map(|c| Some(c.as_str())).collect()
        };

        let mut raw = Vec::new();
        for context in &contexts {
            let images = self.cluster.list_images(*context)?;
            debug!(
                context = context.unwrap_or("<current>"),
                images = images.len(),
                "Found images in context"
            );
            raw.extend(images);
        }

        let unique = ImageRef::collect_unique(raw);
        info!(
            images = unique.len(),
            contexts = contexts.len(),
            "Collected unique cluster images"
        );
        Ok(unique.into_iter().collect())
    }

    /// Lists the registry inventory as image references.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be listed.
    pub fn registry_images(&self) -> Result<Vec<ImageRef>> {
        let host = self.registry.registry_host();
        let images: Vec<ImageRef> = self
            .registry
            .list_repositories_and_tags()?
            .into_iter()
            .filter(|(_, tag)| !tag.is_empty())
            .map(|(repository, tag)| ImageRef::new(host, repository, tag))
            .collect();

        info!(images = images.len(), registry = host, "Collected images from registry");
        Ok(images)
    }

    /// Decides which registry images to delete.
    ///
    /// # Errors
    ///
    /// Returns an error if cluster usage or the registry inventory cannot be
    /// determined.
    #[instrument(
        name = "regclean.cleanup.plan",
        skip(self),
        fields(component = "cleanup", operation = "plan")
    )]
    pub fn plan(&self) -> Result<CleanupPlan> {
        let cluster = self.cluster_images()?;
        let registry = self.registry_images()?;

        let mut reconciled = Reconciler::reconcile(&cluster, &registry);
        let considered = reconciled.to_delete.len() + reconciled.to_keep.len();

        let filter = RetentionFilter::new(self.options.retention.clone());
        let outcome = filter.filter(reconciled.take_candidates(), &self.metadata);
        let filtered = reconciled.apply_retention(&outcome);

        let mut reclaimable_bytes = 0u64;
        for image in &reconciled.to_delete {
            match outcome.metadata.get(image) {
                Some(metadata) => {
                    reclaimable_bytes = reclaimable_bytes.saturating_add(metadata.total_size_bytes);
                    debug!(
                        image = %image,
                        created = %metadata.created_at.format("%Y-%m-%d %H:%M:%S"),
                        size = %crate::cli::format_bytes(metadata.total_size_bytes),
                        "Deletion candidate"
                    );
                },
                None => trace!(image = %image, "Deletion candidate of unknown age and size"),
            }
        }

        let plan = CleanupPlan {
            considered,
            in_use: reconciled.to_keep,
            candidates: reconciled.to_delete,
            filtered,
            reclaimable_bytes,
        };

        info!(
            to_delete = plan.candidates.len(),
            size = %crate::cli::format_bytes(plan.reclaimable_bytes),
            to_keep = plan.kept(),
            protected = reconciled.filtered_count,
            "Found images to delete"
        );
        Ok(plan)
    }

    /// Deletes the candidates of `plan`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Aborted`](crate::Error::Aborted) if the blanket
    /// confirmation is declined.
    #[instrument(
        name = "regclean.cleanup.execute",
        skip(self, plan),
        fields(component = "cleanup", operation = "execute", candidates = plan.candidates.len())
    )]
    pub fn execute(&self, plan: &CleanupPlan) -> Result<CleanupSummary> {
        let start = Instant::now();
        let deletion = self.options.deletion;
        let mut summary = CleanupSummary::from_plan(plan, deletion.dry_run);

        if plan.candidates.is_empty() {
            info!("Nothing to delete");
            return Ok(summary);
        }

        let orchestrator =
            DeletionOrchestrator::new(self.registry.as_ref(), self.confirm.as_ref(), deletion);
        summary.record(orchestrator.execute(&plan.candidates)?);

        metrics::histogram!("regclean_cleanup_duration_ms")
            .record(start.elapsed().as_secs_f64() * 1000.0);
        info!(
            deleted = summary.deleted,
            would_delete = summary.would_delete,
            skipped = summary.skipped,
            failed = summary.failed,
            dry_run = deletion.dry_run,
            "Cleanup completed"
        );
        Ok(summary)
    }

    /// Plans and executes a cleanup.
    ///
    /// # Errors
    ///
    /// Returns an error if planning fails or the run is aborted.
    pub fn run(&self) -> Result<CleanupSummary> {
        let plan = self.plan()?;
        self.execute(&plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tag: &str, outcome: DeletionOutcome) -> DeletionRecord {
        DeletionRecord {
            image: ImageRef::new("reg.io", "app", tag),
            outcome,
        }
    }

    #[test]
    fn test_plan_kept_counts_in_use_and_protected() {
        let plan = CleanupPlan {
            considered: 6,
            in_use: vec![ImageRef::new("reg.io", "app", "v1")],
            candidates: vec![ImageRef::new("reg.io", "app", "v2")],
            filtered: FilterStats {
                include_name: 1,
                exclude_name: 2,
                min_age: 1,
            },
            reclaimable_bytes: 10,
        };
        assert_eq!(plan.kept(), 5);
    }

    #[test]
    fn test_summary_counts_outcomes() {
        let plan = CleanupPlan {
            considered: 4,
            ..CleanupPlan::default()
        };
        let mut summary = CleanupSummary::from_plan(&plan, false);
        summary.record(vec![
            record("v1", DeletionOutcome::Deleted { digest: "sha256:a".to_string() }),
            record("v2", DeletionOutcome::Skipped),
            record("v3", DeletionOutcome::Failed("boom".to_string())),
            record("v4", DeletionOutcome::Deleted { digest: "sha256:b".to_string() }),
        ]);

        assert_eq!(summary.considered, 4);
        assert_eq!(summary.deleted, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.would_delete, 0);
        assert_eq!(summary.outcomes.len(), 4);
        assert!(!summary.dry_run);
    }
}

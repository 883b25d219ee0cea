//! Set difference between registry inventory and cluster usage.

use super::retention::{FilterOutcome, FilterStats};
use crate::models::ImageRef;
use std::collections::HashSet;
use tracing::debug;

/// Registry images split by whether any cluster still runs them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationResult {
    /// Registry images no cluster references, in registry order.
    pub to_delete: Vec<ImageRef>,
    /// Registry images some cluster references, in registry order.
    pub to_keep: Vec<ImageRef>,
    /// Unreferenced images protected by the retention filter. Zero until
    /// [`apply_retention`](Self::apply_retention) runs.
    pub filtered_count: usize,
}

impl ReconciliationResult {
    /// Takes the deletion candidates out for retention filtering.
    #[must_use]
    pub fn take_candidates(&mut self) -> Vec<ImageRef> {
        std::mem::take(&mut self.to_delete)
    }

    /// Narrows `to_delete` to the retention survivors and records how many
    /// candidates the filter protected.
    pub fn apply_retention(&mut self, outcome: &FilterOutcome) -> FilterStats {
        self.to_delete.clone_from(&outcome.survivors);
        self.filtered_count = outcome.filtered_count();
        outcome.stats
    }
}

/// Computes `registry − cluster` and `registry ∩ cluster`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reconciler;

impl Reconciler {
    /// Partitions `registry_refs` against the set of images running in clusters.
    ///
    /// Matching uses exact `(host, repository, tag)` equality. Duplicate
    /// registry entries are collapsed to their first occurrence, so
    /// `to_delete.len() + to_keep.len()` equals the number of distinct
    /// registry images.
    #[must_use]
    pub fn reconcile(cluster_refs: &HashSet<ImageRef>, registry_refs: &[ImageRef]) -> ReconciliationResult {
        let mut seen = HashSet::with_capacity(registry_refs.len());
        let mut result = ReconciliationResult::default();

        for image in registry_refs {
            if !seen.insert(image) {
                continue;
            }
            if cluster_refs.contains(image) {
                result.to_keep.push(image.clone());
            } else {
                result.to_delete.push(image.clone());
            }
        }

        debug!(
            registry = seen.len(),
            cluster = cluster_refs.len(),
            to_delete = result.to_delete.len(),
            to_keep = result.to_keep.len(),
            "Reconciled registry inventory"
        );

        result
    }
}

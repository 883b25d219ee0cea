//! Retention policy for deletion candidates.
//!
//! Candidates produced by the [`Reconciler`](super::Reconciler) are checked
//! against three rules, in order. The first rule that matches protects the
//! image from deletion:
//!
//! 1. **include name**: include patterns are set and the repository contains
//!    none of them
//! 2. **exclude name**: the repository contains at least one exclude pattern
//! 3. **minimum age**: the image was created less than `min_age_days` ago
//!
//! Patterns are plain substrings of the repository path. An image whose
//! creation time cannot be looked up stays eligible.
//!
//! # Example
//!
//! ```rust,ignore
//! use regclean::gc::{RetentionFilter, RetentionFilterConfig};
//!
//! let config = RetentionFilterConfig::default()
//!     .with_min_age_days(30)
//!     .with_exclude_patterns(["old"]);
//! let outcome = RetentionFilter::new(config).filter(candidates, &metadata_service);
//! println!("{} images protected", outcome.filtered_count());
//! ```

use crate::Result;
use crate::models::{ImageMetadata, ImageRef};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, instrument, trace};

/// Default minimum age in days before an unreferenced image may be deleted.
pub const DEFAULT_MIN_AGE_DAYS: u32 = 30;

/// Resolves creation time and size for a candidate image.
pub trait MetadataLookup {
    /// Looks up metadata for `image`.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata cannot be determined.
    fn lookup(&self, image: &ImageRef) -> Result<ImageMetadata>;
}

impl<F> MetadataLookup for F
where
    F: Fn(&ImageRef) -> Result<ImageMetadata>,
{
    fn lookup(&self, image: &ImageRef) -> Result<ImageMetadata> {
        self(image)
    }
}

/// Retention rules applied to deletion candidates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionFilterConfig {
    /// Images younger than this many days are kept.
    pub min_age_days: u32,

    /// Repositories containing any of these substrings are kept.
    pub exclude_name_patterns: Vec<String>,

    /// When non-empty, only repositories containing one of these substrings
    /// may be deleted.
    pub include_name_patterns: Vec<String>,
}

impl Default for RetentionFilterConfig {
    fn default() -> Self {
        Self {
            min_age_days: DEFAULT_MIN_AGE_DAYS,
            exclude_name_patterns: Vec::new(),
            include_name_patterns: Vec::new(),
        }
    }
}

impl RetentionFilterConfig {
    /// Sets the minimum age in days.
    #[must_use]
    pub const fn with_min_age_days(mut self, days: u32) -> Self {
        self.min_age_days = days;
        self
    }

    /// Sets the exclude patterns. Empty patterns are dropped.
    #[must_use]
    pub fn with_exclude_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_name_patterns = non_empty(patterns);
        self
    }

    /// Sets the include patterns. Empty patterns are dropped.
    #[must_use]
    pub fn with_include_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include_name_patterns = non_empty(patterns);
        self
    }

    /// Returns the creation-time boundary relative to `now`.
    ///
    /// Images created at or before the cutoff are old enough to delete.
    #[must_use]
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(i64::from(self.min_age_days))
    }
}

fn non_empty<I, S>(patterns: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    patterns
        .into_iter()
        .map(Into::into)
        .filter(|p| !p.is_empty())
        .collect()
}

/// Rule that protected an image from deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterReason {
    /// Repository matched none of the include patterns.
    IncludeName,
    /// Repository matched an exclude pattern.
    ExcludeName,
    /// Image is younger than the minimum age.
    MinAge,
}

impl FilterReason {
    /// Returns the stats key for this reason.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::IncludeName => "include_name",
            Self::ExcludeName => "exclude_name",
            Self::MinAge => "min_age",
        }
    }
}

impl fmt::Display for FilterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-reason counts of protected images.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FilterStats {
    /// Images protected by the include patterns.
    pub include_name: usize,
    /// Images protected by the exclude patterns.
    pub exclude_name: usize,
    /// Images protected by the minimum age.
    pub min_age: usize,
}

impl FilterStats {
    /// Total number of protected images.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.include_name + self.exclude_name + self.min_age
    }

    const fn record(&mut self, reason: FilterReason) {
        match reason {
            FilterReason::IncludeName => self.include_name += 1,
            FilterReason::ExcludeName => self.exclude_name += 1,
            FilterReason::MinAge => self.min_age += 1,
        }
    }
}

/// Result of filtering a candidate list.
#[derive(Debug, Clone, Default)]
pub struct FilterOutcome {
    /// Candidates still eligible for deletion, in input order.
    pub survivors: Vec<ImageRef>,
    /// Why the other candidates were protected.
    pub stats: FilterStats,
    /// Metadata looked up for survivors. Survivors whose lookup failed are
    /// absent, so callers never repeat a lookup that already failed.
    pub metadata: HashMap<ImageRef, ImageMetadata>,
}

impl FilterOutcome {
    /// Number of candidates removed by the filter.
    #[must_use]
    pub const fn filtered_count(&self) -> usize {
        self.stats.total()
    }
}

/// Applies a [`RetentionFilterConfig`] to deletion candidates.
#[derive(Debug, Clone, Default)]
pub struct RetentionFilter {
    config: RetentionFilterConfig,
}

impl RetentionFilter {
    /// Creates a filter for the given rules.
    #[must_use]
    pub const fn new(config: RetentionFilterConfig) -> Self {
        Self { config }
    }

    /// Returns the configured rules.
    #[must_use]
    pub const fn config(&self) -> &RetentionFilterConfig {
        &self.config
    }

    /// Filters `candidates` against the current time.
    #[instrument(
        name = "regclean.gc.retention",
        skip(self, candidates, lookup),
        fields(
            component = "gc",
            operation = "retention",
            candidates = candidates.len(),
            min_age_days = self.config.min_age_days
        )
    )]
    pub fn filter(&self, candidates: Vec<ImageRef>, lookup: &dyn MetadataLookup) -> FilterOutcome {
        self.filter_at(candidates, lookup, Utc::now())
    }

    /// Filters `candidates` as of `now`.
    pub fn filter_at(
        &self,
        candidates: Vec<ImageRef>,
        lookup: &dyn MetadataLookup,
        now: DateTime<Utc>,
    ) -> FilterOutcome {
        let cutoff = self.config.cutoff(now);
        let mut outcome = FilterOutcome::default();

        for image in candidates {
            match self.verdict(&image, lookup, cutoff) {
                Verdict::Protect(reason) => {
                    trace!(image = %image, reason = reason.as_str(), "Keeping image");
                    outcome.stats.record(reason);
                },
                Verdict::Eligible(metadata) => {
                    if let Some(metadata) = metadata {
                        outcome.metadata.insert(image.clone(), metadata);
                    }
                    outcome.survivors.push(image);
                },
            }
        }

        let stats = outcome.stats;
        metrics::counter!("regclean_images_filtered_total", "reason" => "include_name")
            .increment(stats.include_name as u64);
        metrics::counter!("regclean_images_filtered_total", "reason" => "exclude_name")
            .increment(stats.exclude_name as u64);
        metrics::counter!("regclean_images_filtered_total", "reason" => "min_age")
            .increment(stats.min_age as u64);

        debug!(
            survivors = outcome.survivors.len(),
            include_name = stats.include_name,
            exclude_name = stats.exclude_name,
            min_age = stats.min_age,
            "Retention filter applied"
        );

        outcome
    }

    /// Applies the rules to `image`, stopping at the first that protects it.
    fn verdict(
        &self,
        image: &ImageRef,
        lookup: &dyn MetadataLookup,
        cutoff: DateTime<Utc>,
    ) -> Verdict {
        let repository = image.repository.as_str();
        let config = &self.config;

        if !config.include_name_patterns.is_empty()
            && !config
                .include_name_patterns
                .iter()
                .any(|p| repository.contains(p.as_str()))
        {
            return Verdict::Protect(FilterReason::IncludeName);
        }

        if config
            .exclude_name_patterns
            .iter()
            .any(|p| repository.contains(p.as_str()))
        {
            return Verdict::Protect(FilterReason::ExcludeName);
        }

        match lookup.lookup(image) {
            Ok(metadata) if metadata.created_at > cutoff => {
                Verdict::Protect(FilterReason::MinAge)
            },
            Ok(metadata) => Verdict::Eligible(Some(metadata)),
            Err(e) => {
                debug!(image = %image, error = %e, "Age unknown, image stays eligible");
                Verdict::Eligible(None)
            },
        }
    }
}

enum Verdict {
    Protect(FilterReason),
    Eligible(Option<ImageMetadata>),
}

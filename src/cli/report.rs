//! Plain-text reports written to stdout.

use crate::gc::DeletionOutcome;
use crate::models::ImageRef;
use crate::services::CleanupSummary;
use std::collections::BTreeMap;
use std::fmt::Write;

/// SI units used by [`format_bytes`].
const UNITS: [&str; 7] = ["B", "kB", "MB", "GB", "TB", "PB", "EB"];

/// Formats a byte count with SI units, e.g. `83 MB` or `1.5 kB`.
///
/// Values below ten of a unit keep one decimal.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 10 {
        return format!("{bytes} B");
    }

    let mut exponent = 0;
    let mut scale = 1u64;
    while exponent + 1 < UNITS.len() && bytes / scale >= 1000 {
        scale *= 1000;
        exponent += 1;
    }

    let value = ((bytes as f64 / scale as f64) * 10.0 + 0.5).floor() / 10.0;
    if value < 10.0 {
        format!("{value:.1} {}", UNITS[exponent])
    } else {
        format!("{value:.0} {}", UNITS[exponent])
    }
}

/// Renders a `REGISTRY  REPOSITORY  COUNT` table of `images`.
///
/// Rows are sorted by registry, then repository.
#[must_use]
pub fn render_repository_counts(images: &[ImageRef]) -> String {
    let mut counts: BTreeMap<(&str, &str), usize> = BTreeMap::new();
    for image in images {
        *counts
            .entry((image.registry_host.as_str(), image.repository.as_str()))
            .or_default() += 1;
    }

    let headers = ("REGISTRY", "REPOSITORY", "COUNT");
    let registry_width = counts
        .keys()
        .map(|(registry, _)| registry.len())
        .chain([headers.0.len()])
        .max()
        .unwrap_or_default();
    let repository_width = counts
        .keys()
        .map(|(_, repository)| repository.len())
        .chain([headers.1.len()])
        .max()
        .unwrap_or_default();

    let mut out = String::new();
    let mut row = |registry: &str, repository: &str, count: &str| {
        let _ = writeln!(
            out,
            "{registry:<registry_width$}  {repository:<repository_width$}  {count}"
        );
    };

    row(headers.0, headers.1, headers.2);
    for ((registry, repository), count) in &counts {
        row(registry, repository, &count.to_string());
    }
    out
}

/// Renders the end-of-run summary, including one line per failed deletion.
#[must_use]
pub fn render_summary(summary: &CleanupSummary) -> String {
    let mut out = String::new();
    let candidates = summary.outcomes.len();

    if candidates == 0 {
        out.push_str("Nothing to delete");
    } else if summary.dry_run {
        let _ = write!(
            out,
            "Dry run: would delete {} images ({})",
            summary.would_delete,
            format_bytes(summary.reclaimable_bytes)
        );
    } else {
        let _ = write!(
            out,
            "Deleted {} of {candidates} images ({} reclaimable), {} skipped, {} failed",
            summary.deleted,
            format_bytes(summary.reclaimable_bytes),
            summary.skipped,
            summary.failed
        );
    }

    let _ = writeln!(
        out,
        "; kept {} of {} (include_name: {}, exclude_name: {}, min_age: {})",
        summary.kept,
        summary.considered,
        summary.filtered.include_name,
        summary.filtered.exclude_name,
        summary.filtered.min_age
    );

    for record in &summary.outcomes {
        if let DeletionOutcome::Failed(reason) = &record.outcome {
            let _ = writeln!(out, "  failed {}: {reason}", record.image);
        }
    }

    out
}

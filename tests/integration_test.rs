//! Integration tests for regclean.
//!
//! Runs the whole plan/execute pipeline against in-memory cluster and registry
//! sources with real cache backends.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::too_many_lines,
    clippy::doc_markdown
)]

use chrono::{Duration, Utc};
use regclean::cli::FixedAnswer;
use regclean::cluster::ClusterImageSource;
use regclean::gc::{DeletionOptions, DeletionOutcome, RetentionFilterConfig};
use regclean::registry::RegistryInventorySource;
use regclean::services::{CleanupOptions, CleanupService};
use regclean::storage::{LockMode, LockOptions, LockedFile};
use regclean::{
    Error, FilesystemCache, ImageMetadata, ImageRef, ManifestMetadata, MetadataCache,
    MetadataService, Result, SqliteCache,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const HOST: &str = "reg.example.com";

// ============================================================================
// Fakes
// ============================================================================

#[derive(Default)]
struct FakeCluster {
    images: HashMap<Option<String>, Vec<String>>,
    queried: Mutex<Vec<Option<String>>>,
}

impl FakeCluster {
    fn with_context(mut self, context: Option<&str>, images: &[&str]) -> Self {
        self.images.insert(
            context.map(str::to_string),
            images.iter().map(|i| (*i).to_string()).collect(),
        );
        self
    }
}

impl ClusterImageSource for FakeCluster {
    fn list_images(&self, context: Option<&str>) -> Result<Vec<String>> {
        let context = context.map(str::to_string);
        self.queried.lock().unwrap().push(context.clone());
        self.images
            .get(&context)
            .cloned()
            .ok_or_else(|| Error::OperationFailed {
                operation: "list_images".to_string(),
                cause: format!("unknown context {context:?}"),
            })
    }
}

#[derive(Default)]
struct FakeRegistry {
    tags: Vec<(String, String)>,
    manifests: HashMap<(String, String), ManifestMetadata>,
    failing_deletes: HashSet<String>,
    deleted: Mutex<Vec<(String, String)>>,
    fetches: Mutex<usize>,
}

impl FakeRegistry {
    fn with_image(mut self, repository: &str, tag: &str, age_days: i64) -> Self {
        self.tags.push((repository.to_string(), tag.to_string()));
        self.manifests.insert(
            (repository.to_string(), tag.to_string()),
            ManifestMetadata {
                digest: format!("sha256:{repository}-{tag}"),
                created_at: Utc::now() - Duration::days(age_days),
                total_size_bytes: 1_000_000,
            },
        );
        self
    }

    /// Lists a tag whose manifest cannot be fetched.
    fn with_unresolvable(mut self, repository: &str, tag: &str) -> Self {
        self.tags.push((repository.to_string(), tag.to_string()));
        self
    }

    fn failing_delete(mut self, repository: &str) -> Self {
        self.failing_deletes.insert(repository.to_string());
        self
    }

    fn deleted(&self) -> Vec<(String, String)> {
        self.deleted.lock().unwrap().clone()
    }

    fn fetch_count(&self) -> usize {
        *self.fetches.lock().unwrap()
    }
}

impl RegistryInventorySource for FakeRegistry {
    fn registry_host(&self) -> &str {
        HOST
    }

    fn list_repositories_and_tags(&self) -> Result<Vec<(String, String)>> {
        Ok(self.tags.clone())
    }

    fn fetch_manifest_metadata(&self, repository: &str, tag: &str) -> Result<ManifestMetadata> {
        *self.fetches.lock().unwrap() += 1;
        self.manifests
            .get(&(repository.to_string(), tag.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{repository}:{tag}")))
    }

    fn delete_manifest(&self, repository: &str, digest: &str) -> Result<()> {
        if self.failing_deletes.contains(repository) {
            return Err(Error::OperationFailed {
                operation: "delete_manifest".to_string(),
                cause: "status 500".to_string(),
            });
        }
        self.deleted
            .lock()
            .unwrap()
            .push((repository.to_string(), digest.to_string()));
        Ok(())
    }
}

/// Cluster runs `app:v1` (twice, once pinned by digest); the registry also
/// holds an old unused tag, a young unused tag and an old tag of an excluded
/// repository.
fn scenario() -> (FakeCluster, FakeRegistry) {
    let cluster = FakeCluster::default().with_context(
        None,
        &[
            "reg.example.com/app:v1",
            "reg.example.com/app:v1@sha256:0123",
            "reg.example.com/app:v1",
        ],
    );
    let registry = FakeRegistry::default()
        .with_image("app", "v1", 90)
        .with_image("app", "v2", 60)
        .with_image("app", "v3", 10)
        .with_image("old-app", "v1", 60);
    (cluster, registry)
}

fn options(deletion: DeletionOptions) -> CleanupOptions {
    CleanupOptions {
        contexts: Vec::new(),
        retention: RetentionFilterConfig::default()
            .with_min_age_days(30)
            .with_exclude_patterns(["old"]),
        deletion,
    }
}

fn service(
    cluster: Arc<FakeCluster>,
    registry: Arc<FakeRegistry>,
    cache: Arc<dyn MetadataCache>,
    answer: bool,
    deletion: DeletionOptions,
) -> CleanupService {
    CleanupService::new(
        cluster,
        registry,
        cache,
        Arc::new(FixedAnswer(answer)),
        options(deletion),
    )
}

fn filesystem_cache(dir: &TempDir) -> Arc<dyn MetadataCache> {
    Arc::new(FilesystemCache::new(dir.path().join("cache")).unwrap())
}

// ============================================================================
// Pipeline
// ============================================================================

#[test]
fn test_plan_keeps_used_young_and_excluded_images() {
    let dir = TempDir::new().unwrap();
    let (cluster, registry) = scenario();
    let svc = service(
        Arc::new(cluster),
        Arc::new(registry),
        filesystem_cache(&dir),
        true,
        DeletionOptions::default(),
    );

    let plan = svc.plan().unwrap();

    assert_eq!(plan.considered, 4);
    assert_eq!(plan.in_use, vec![ImageRef::new(HOST, "app", "v1")]);
    assert_eq!(plan.candidates, vec![ImageRef::new(HOST, "app", "v2")]);
    assert_eq!(plan.filtered.exclude_name, 1);
    assert_eq!(plan.filtered.min_age, 1);
    assert_eq!(plan.kept(), 3);
    assert_eq!(plan.reclaimable_bytes, 1_000_000);
}

#[test]
fn test_run_deletes_confirmed_candidates() {
    let dir = TempDir::new().unwrap();
    let (cluster, registry) = scenario();
    let registry = Arc::new(registry);
    let svc = service(
        Arc::new(cluster),
        Arc::clone(&registry),
        filesystem_cache(&dir),
        true,
        DeletionOptions::default(),
    );

    let summary = svc.run().unwrap();

    assert_eq!(summary.deleted, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.kept, 3);
    assert_eq!(
        registry.deleted(),
        vec![("app".to_string(), "sha256:app-v2".to_string())]
    );
}

#[test]
fn test_dry_run_never_deletes() {
    let dir = TempDir::new().unwrap();
    let (cluster, registry) = scenario();
    let registry = Arc::new(registry);
    // A "no" answer would skip; dry run must not ask per image.
    let svc = service(
        Arc::new(cluster),
        Arc::clone(&registry),
        filesystem_cache(&dir),
        false,
        DeletionOptions {
            dry_run: true,
            yolo: false,
        },
    );

    let summary = svc.run().unwrap();

    assert!(summary.dry_run);
    assert_eq!(summary.would_delete, 1);
    assert_eq!(summary.deleted, 0);
    assert!(registry.deleted().is_empty());
    assert_eq!(
        summary.outcomes[0].outcome,
        DeletionOutcome::WouldDelete {
            digest: "sha256:app-v2".to_string()
        }
    );
}

#[test]
fn test_declined_confirmation_skips() {
    let dir = TempDir::new().unwrap();
    let (cluster, registry) = scenario();
    let registry = Arc::new(registry);
    let svc = service(
        Arc::new(cluster),
        Arc::clone(&registry),
        filesystem_cache(&dir),
        false,
        DeletionOptions::default(),
    );

    let summary = svc.run().unwrap();

    assert_eq!(summary.skipped, 1);
    assert!(registry.deleted().is_empty());
}

#[test]
fn test_declined_yolo_aborts_before_deleting() {
    let dir = TempDir::new().unwrap();
    let (cluster, registry) = scenario();
    let registry = Arc::new(registry);
    let svc = service(
        Arc::new(cluster),
        Arc::clone(&registry),
        filesystem_cache(&dir),
        false,
        DeletionOptions {
            dry_run: false,
            yolo: true,
        },
    );

    let result = svc.run();

    assert!(matches!(result, Err(Error::Aborted(_))));
    assert!(registry.deleted().is_empty());
}

#[test]
fn test_declined_yolo_aborts_dry_run_too() {
    let dir = TempDir::new().unwrap();
    let (cluster, registry) = scenario();
    let svc = service(
        Arc::new(cluster),
        Arc::new(registry),
        filesystem_cache(&dir),
        false,
        DeletionOptions {
            dry_run: true,
            yolo: true,
        },
    );

    assert!(matches!(svc.run(), Err(Error::Aborted(_))));
}

#[test]
fn test_delete_failure_does_not_stop_batch() {
    let dir = TempDir::new().unwrap();
    let cluster = FakeCluster::default().with_context(None, &[]);
    let registry = Arc::new(
        FakeRegistry::default()
            .with_image("broken", "v1", 60)
            .with_image("healthy", "v1", 60)
            .failing_delete("broken"),
    );
    let svc = service(
        Arc::new(cluster),
        Arc::clone(&registry),
        filesystem_cache(&dir),
        true,
        DeletionOptions {
            dry_run: false,
            yolo: true,
        },
    );

    let summary = svc.run().unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.deleted, 1);
    assert!(matches!(summary.outcomes[0].outcome, DeletionOutcome::Failed(_)));
    assert_eq!(
        registry.deleted(),
        vec![("healthy".to_string(), "sha256:healthy-v1".to_string())]
    );
}

#[test]
fn test_contexts_are_all_scanned() {
    let dir = TempDir::new().unwrap();
    let cluster = Arc::new(
        FakeCluster::default()
            .with_context(Some("prod"), &["reg.example.com/app:v1"])
            .with_context(Some("staging"), &["reg.example.com/app:v2"]),
    );
    let registry = Arc::new(
        FakeRegistry::default()
            .with_image("app", "v1", 60)
            .with_image("app", "v2", 60),
    );
    let svc = CleanupService::new(
        Arc::clone(&cluster) as Arc<dyn ClusterImageSource>,
        registry,
        filesystem_cache(&dir),
        Arc::new(FixedAnswer(true)),
        CleanupOptions {
            contexts: vec!["prod".to_string(), "staging".to_string()],
            ..options(DeletionOptions::default())
        },
    );

    let plan = svc.plan().unwrap();

    assert!(plan.candidates.is_empty());
    assert_eq!(plan.in_use.len(), 2);
    assert_eq!(
        *cluster.queried.lock().unwrap(),
        vec![Some("prod".to_string()), Some("staging".to_string())]
    );
}

#[test]
fn test_unknown_context_fails_the_run() {
    let dir = TempDir::new().unwrap();
    let (cluster, registry) = scenario();
    let svc = CleanupService::new(
        Arc::new(cluster),
        Arc::new(registry),
        filesystem_cache(&dir),
        Arc::new(FixedAnswer(true)),
        CleanupOptions {
            contexts: vec!["missing".to_string()],
            ..options(DeletionOptions::default())
        },
    );

    assert!(svc.plan().is_err());
}

// ============================================================================
// Metadata cache
// ============================================================================

#[test]
fn test_second_plan_is_served_from_sqlite_cache() {
    let dir = TempDir::new().unwrap();
    let cache: Arc<dyn MetadataCache> =
        Arc::new(SqliteCache::new(dir.path().join("cache.db")).unwrap());
    let (cluster, registry) = scenario();
    let cluster = Arc::new(cluster);
    let registry = Arc::new(registry);

    let first = service(
        Arc::clone(&cluster),
        Arc::clone(&registry),
        Arc::clone(&cache),
        true,
        DeletionOptions::default(),
    );
    first.plan().unwrap();
    let fetches_after_first = registry.fetch_count();
    assert!(fetches_after_first > 0);
    assert!(cache.get("app:v2").unwrap().is_some());

    let second = service(cluster, Arc::clone(&registry), cache, true, DeletionOptions::default());
    let plan = second.plan().unwrap();

    assert_eq!(plan.candidates, vec![ImageRef::new(HOST, "app", "v2")]);
    assert_eq!(registry.fetch_count(), fetches_after_first);
}

#[test]
fn test_failed_metadata_lookup_is_not_repeated_when_planning() {
    let dir = TempDir::new().unwrap();
    let cluster = FakeCluster::default().with_context(None, &[]);
    let registry = Arc::new(
        FakeRegistry::default()
            .with_unresolvable("ghost", "v1")
            .with_image("app", "v1", 60),
    );
    let svc = service(
        Arc::new(cluster),
        Arc::clone(&registry),
        filesystem_cache(&dir),
        true,
        DeletionOptions::default(),
    );

    let plan = svc.plan().unwrap();

    assert_eq!(
        plan.candidates,
        vec![ImageRef::new(HOST, "ghost", "v1"), ImageRef::new(HOST, "app", "v1")]
    );
    assert_eq!(plan.reclaimable_bytes, 1_000_000);
    assert_eq!(registry.fetch_count(), 2);
}

#[test]
fn test_locked_entry_times_out_and_lookup_falls_back() {
    let dir = TempDir::new().unwrap();
    let fast = LockOptions {
        timeout: std::time::Duration::from_millis(50),
        poll_interval: std::time::Duration::from_millis(10),
    };
    let cache = FilesystemCache::new(dir.path()).unwrap().with_lock_options(fast);
    let cached = ImageMetadata {
        created_at: Utc::now() - Duration::days(400),
        total_size_bytes: 7,
    };
    cache.set("app:v2", &cached).unwrap();

    let path = cache.entry_path("app:v2");
    let holder = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .unwrap();
    let _guard = LockedFile::acquire(holder, &path, LockMode::Exclusive, fast).unwrap();

    let err = cache.get("app:v2").unwrap_err();
    assert!(matches!(err, Error::LockTimeout { .. }));
    assert!(err.is_cache_degradation());

    let registry = Arc::new(FakeRegistry::default().with_image("app", "v2", 60));
    let source: Arc<dyn RegistryInventorySource> = Arc::<FakeRegistry>::clone(&registry);
    let metadata = MetadataService::new(Arc::new(cache), source);
    let resolved = metadata.get(&ImageRef::new(HOST, "app", "v2")).unwrap();

    assert_eq!(resolved.total_size_bytes, 1_000_000);
    assert_eq!(registry.fetch_count(), 1);
}

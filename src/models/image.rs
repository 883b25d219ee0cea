//! Image identity and reference normalization.
//!
//! Image references arrive in many shapes: `host/repo:tag` from a registry
//! listing, `host/repo@sha256:...` from a pinned deployment, or
//! `host/repo:tag@sha256:...` from a runtime that resolved the tag. All of them
//! are reduced to the same `(host, repository, tag)` triple so that cluster
//! usage and registry inventory can be compared with plain equality.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Registry host assumed for references without an explicit host.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Normalized identity of an image tag within a registry.
///
/// Two references that differ only by digest are the same `ImageRef`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageRef {
    /// Registry host, including the port when one was given.
    pub registry_host: String,
    /// Repository path, possibly with several `/` separated segments.
    pub repository: String,
    /// Tag, empty for digest-only references.
    pub tag: String,
}

impl ImageRef {
    /// Creates an image reference from already separated parts.
    #[must_use]
    pub fn new(
        registry_host: impl Into<String>,
        repository: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            registry_host: registry_host.into(),
            repository: repository.into(),
            tag: tag.into(),
        }
    }

    /// Normalizes a free-form image reference.
    ///
    /// Everything from the first `@` onward is dropped. The tag is split off at
    /// the last `:` that follows the last `/`, so a `host:port` prefix is never
    /// taken for a tag. Parsing is best-effort and never fails.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use regclean::ImageRef;
    ///
    /// let image = ImageRef::normalize("localhost:5000/team/app:v1@sha256:abc");
    /// assert_eq!(image.registry_host, "localhost:5000");
    /// assert_eq!(image.repository, "team/app");
    /// assert_eq!(image.tag, "v1");
    /// ```
    #[must_use]
    pub fn normalize(raw: &str) -> Self {
        let raw = raw.trim();
        let name = raw.split_once('@').map_or(raw, |(name, _digest)| name);

        let last_slash = name.rfind('/');
        let (path, tag) = match name.rfind(':') {
            Some(colon) if last_slash.is_none_or(|slash| colon > slash) => {
                (&name[..colon], &name[colon + 1..])
            },
            _ => (name, ""),
        };

        let (registry_host, repository) = split_registry_host(path);
        Self {
            registry_host,
            repository,
            tag: tag.to_string(),
        }
    }

    /// Normalizes and deduplicates a batch of raw references.
    ///
    /// Order of first occurrence is preserved. References without a tag are
    /// discarded since they cannot be matched against a registry tag listing.
    pub fn collect_unique<I, S>(raw: I) -> Vec<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let mut unique = Vec::new();

        for reference in raw {
            let image = Self::normalize(reference.as_ref());
            if !image.has_tag() {
                tracing::trace!(reference = reference.as_ref(), "Discarding untagged image reference");
                continue;
            }
            if seen.insert(image.clone()) {
                unique.push(image);
            }
        }

        unique
    }

    /// Returns `true` if the reference carries a tag.
    #[must_use]
    pub const fn has_tag(&self) -> bool {
        !self.tag.is_empty()
    }

    /// Returns the metadata cache key, `repository:tag`.
    #[must_use]
    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry_host, self.repository)?;
        if self.has_tag() {
            write!(f, ":{}", self.tag)?;
        }
        Ok(())
    }
}

/// Splits `host/repo` into host and repository.
///
/// The first segment is a host only if it looks like one (contains a `.` or a
/// `:`, or is `localhost`). Anything else lives on the default registry, where
/// single-segment names belong to the `library/` namespace.
fn split_registry_host(path: &str) -> (String, String) {
    let (host, repository) = match path.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first, rest)
        },
        _ => (DEFAULT_REGISTRY, path),
    };

    let repository = if host == DEFAULT_REGISTRY && !repository.contains('/') {
        format!("library/{repository}")
    } else {
        repository.to_string()
    };

    (host.to_string(), repository)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("reg.io/app:v1", "reg.io", "app", "v1"; "host repo tag")]
    #[test_case("reg.io/app@sha256:abc", "reg.io", "app", ""; "digest only")]
    #[test_case("reg.io/app:v1@sha256:abc", "reg.io", "app", "v1"; "tag and digest")]
    #[test_case("reg.io:5000/team/app:v2", "reg.io:5000", "team/app", "v2"; "host with port")]
    #[test_case("reg.io:5000/team/app", "reg.io:5000", "team/app", ""; "port without tag")]
    #[test_case("localhost/app:dev", "localhost", "app", "dev"; "localhost")]
    #[test_case("nginx:1.25", "docker.io", "library/nginx", "1.25"; "official image")]
    #[test_case("bitnami/redis:7", "docker.io", "bitnami/redis", "7"; "hub namespace")]
    #[test_case("docker.io/nginx:1.25", "docker.io", "library/nginx", "1.25"; "explicit hub")]
    #[test_case("  reg.io/app:v1\n", "reg.io", "app", "v1"; "surrounding whitespace")]
    fn test_normalize(raw: &str, host: &str, repository: &str, tag: &str) {
        let image = ImageRef::normalize(raw);
        assert_eq!(image.registry_host, host);
        assert_eq!(image.repository, repository);
        assert_eq!(image.tag, tag);
    }

    #[test]
    fn test_normalize_is_idempotent_through_display() {
        for raw in [
            "reg.io/app:v1@sha256:abc",
            "reg.io:5000/a/b/c:latest",
            "nginx:1.25",
            "reg.io/app",
        ] {
            let once = ImageRef::normalize(raw);
            let twice = ImageRef::normalize(&once.to_string());
            assert_eq!(once, twice, "normalization not idempotent for {raw}");
        }
    }

    #[test]
    fn test_digest_does_not_affect_identity() {
        assert_eq!(
            ImageRef::normalize("reg.io/app:v1@sha256:0123"),
            ImageRef::normalize("reg.io/app:v1")
        );
    }

    #[test]
    fn test_collect_unique_preserves_first_occurrence() {
        let images = ImageRef::collect_unique([
            "reg.io/b:v1",
            "reg.io/a:v1",
            "reg.io/b:v1@sha256:ff",
            "reg.io/a:v1",
            "reg.io/c@sha256:ee",
        ]);

        let rendered: Vec<String> = images.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["reg.io/b:v1", "reg.io/a:v1"]);
    }

    #[test]
    fn test_cache_key() {
        let image = ImageRef::normalize("reg.io/team/app:v3");
        assert_eq!(image.cache_key(), "team/app:v3");
    }

    #[test]
    fn test_display_without_tag() {
        let image = ImageRef::new("reg.io", "app", "");
        assert_eq!(image.to_string(), "reg.io/app");
    }
}

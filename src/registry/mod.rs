//! Container registry access.
//!
//! The cleanup pipeline talks to a registry through [`RegistryInventorySource`].
//! [`HttpRegistryClient`] implements it against the Docker Registry HTTP API
//! v2; tests substitute in-memory fakes.
//!
//! Credentials are produced by a [`CredentialResolver`]: either static values
//! from configuration ([`StaticCredentials`]) or a token exchange with AWS ECR
//! ([`EcrCredentials`]).

mod auth;
mod client;

pub use auth::{CredentialResolver, Credentials, EcrCredentials, StaticCredentials};
pub use client::{
    BearerChallenge, HttpRegistryClient, parse_bearer_challenge, parse_next_link,
    registry_host_from_url,
};

use crate::Result;
use crate::models::ManifestMetadata;

/// Read and delete access to a registry's tag inventory.
///
/// # Errors
///
/// Operations on a single image return [`Error::NotFound`](crate::Error::NotFound)
/// when the registry has no such manifest; transport and server failures are
/// reported as [`Error::OperationFailed`](crate::Error::OperationFailed).
pub trait RegistryInventorySource {
    /// Host prefix (`host[:port]`) under which this registry's images are
    /// referenced by clusters.
    fn registry_host(&self) -> &str;

    /// Lists every `(repository, tag)` pair stored in the registry.
    fn list_repositories_and_tags(&self) -> Result<Vec<(String, String)>>;

    /// Fetches digest, creation time and total size of a tagged manifest.
    fn fetch_manifest_metadata(&self, repository: &str, tag: &str) -> Result<ManifestMetadata>;

    /// Resolves the manifest digest a tag currently points to.
    ///
    /// The default implementation fetches the full metadata.
    fn manifest_digest(&self, repository: &str, tag: &str) -> Result<String> {
        self.fetch_manifest_metadata(repository, tag)
            .map(|manifest| manifest.digest)
    }

    /// Deletes a manifest by digest.
    fn delete_manifest(&self, repository: &str, digest: &str) -> Result<()>;
}

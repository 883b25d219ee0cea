//! Docker Registry HTTP API v2 client.
//!
//! Blocking client used by the cleanup pipeline. Requests carry HTTP basic
//! credentials; registries that answer with a `Bearer` challenge get a token
//! from the advertised realm, which is then cached per repository.

use super::RegistryInventorySource;
use super::auth::{Credentials, basic_auth_parts};
use crate::models::ManifestMetadata;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{Method, StatusCode, Url, header};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, trace};

/// Accept header for single-image manifests.
const ACCEPT_MANIFEST: &str = concat!(
    "application/vnd.docker.distribution.manifest.v2+json, ",
    "application/vnd.oci.image.manifest.v1+json"
);

/// Response header carrying the manifest digest.
const DIGEST_HEADER: &str = "Docker-Content-Digest";

/// Default request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default connect timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Page size requested from listing endpoints.
const PAGE_SIZE: usize = 1000;

/// Longest error body kept in an error message.
const MAX_ERROR_BODY: usize = 512;

/// `key="value"` pairs of a `WWW-Authenticate` challenge.
static CHALLENGE_PARAM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([A-Za-z_]+)\s*=\s*"([^"]*)""#).unwrap_or_else(|_| unreachable!())
});

/// `<url>; rel="next"` entry of an RFC 5988 `Link` header.
static NEXT_LINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<([^>]+)>\s*;\s*rel\s*=\s*"?next"?"#).unwrap_or_else(|_| unreachable!())
});

/// Parameters of a `Bearer` authentication challenge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BearerChallenge {
    /// Token endpoint.
    pub realm: String,
    /// Service name to request a token for.
    pub service: Option<String>,
    /// Requested access scope.
    pub scope: Option<String>,
}

/// Parses a `WWW-Authenticate: Bearer ...` header value.
///
/// Returns `None` for other schemes or when no realm is advertised.
#[must_use]
pub fn parse_bearer_challenge(value: &str) -> Option<BearerChallenge> {
    let value = value.trim();
    let params = value
        .get(..6)
        .filter(|scheme| scheme.eq_ignore_ascii_case("bearer"))
        .map(|_| &value[6..])?;

    let mut challenge = BearerChallenge::default();
    for capture in CHALLENGE_PARAM.captures_iter(params) {
        let value = capture[2].to_string();
        match capture[1].to_ascii_lowercase().as_str() {
            "realm" => challenge.realm = value,
            "service" => challenge.service = Some(value),
            "scope" => challenge.scope = Some(value),
            _ => {},
        }
    }

    (!challenge.realm.is_empty()).then_some(challenge)
}

/// Extracts the `rel="next"` target from a `Link` header value.
#[must_use]
pub fn parse_next_link(value: &str) -> Option<String> {
    NEXT_LINK
        .captures(value)
        .map(|capture| capture[1].to_string())
}

/// Returns the `host[:port]` prefix under which images of `url` are referenced.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if `url` is not an absolute URL with a host.
pub fn registry_host_from_url(url: &str) -> Result<String> {
    let parsed = Url::parse(url)
        .map_err(|e| Error::InvalidInput(format!("invalid registry URL '{url}': {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| Error::InvalidInput(format!("registry URL '{url}' has no host")))?;

    Ok(parsed
        .port()
        .map_or_else(|| host.to_string(), |port| format!("{host}:{port}")))
}

#[derive(Debug, Deserialize)]
struct CatalogResponse {
    #[serde(default)]
    repositories: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    digest: String,
    size: u64,
}

#[derive(Debug, Deserialize)]
struct ImageManifest {
    config: Option<Descriptor>,
    #[serde(default)]
    layers: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
struct ImageConfig {
    created: Option<DateTime<Utc>>,
}

/// Blocking Docker Registry v2 client.
pub struct HttpRegistryClient {
    client: Client,
    /// Base URL without trailing slash.
    base_url: String,
    /// `host[:port]` prefix of image references.
    host: String,
    credentials: Credentials,
    /// Bearer tokens keyed by repository (or `catalog`).
    tokens: Mutex<HashMap<String, String>>,
}

impl std::fmt::Debug for HttpRegistryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRegistryClient")
            .field("base_url", &self.base_url)
            .field("host", &self.host)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl HttpRegistryClient {
    /// Creates a client without contacting the registry.
    ///
    /// # Errors
    ///
    /// Returns an error if `url` is invalid or the HTTP client cannot be built.
    pub fn new(url: &str, credentials: Credentials) -> Result<Self> {
        let base_url = url.trim().trim_end_matches('/').to_string();
        let host = registry_host_from_url(&base_url)?;

        let client = Client::builder()
            .user_agent(concat!("regclean/", env!("CARGO_PKG_VERSION")))
            .timeout(DEFAULT_TIMEOUT)
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| Error::OperationFailed {
                operation: "build_http_client".to_string(),
                cause: e.to_string(),
            })?;

        Ok(Self {
            client,
            base_url,
            host,
            credentials,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    /// Creates a client and verifies the registry answers `GET /v2/`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unauthorized`] if the credentials are rejected and
    /// [`Error::OperationFailed`] if the registry cannot be reached.
    pub fn connect(url: &str, credentials: Credentials) -> Result<Self> {
        let client = Self::new(url, credentials)?;
        client.ping()?;
        Ok(client)
    }

    /// Returns the base URL of the registry.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Checks that the registry speaks API v2 and accepts the credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if the ping fails.
    #[instrument(skip(self), fields(operation = "ping", backend = "registry", registry = %self.host))]
    pub fn ping(&self) -> Result<()> {
        let url = format!("{}/v2/", self.base_url);
        let start = Instant::now();
        let result = self
            .send(Method::GET, &url, "catalog", None)
            .and_then(|response| check_status(response, "ping", &self.base_url))
            .map(|_| ());
        record_request_metrics("ping", start, result.is_ok());

        if result.is_ok() {
            debug!(registry = %self.host, "Registry reachable");
        }
        result
    }

    fn request(&self, method: Method, url: &str, accept: Option<&str>) -> RequestBuilder {
        let request = self.client.request(method, url);
        match accept {
            Some(accept) => request.header(header::ACCEPT, accept),
            None => request,
        }
    }

    fn with_basic_auth(&self, request: RequestBuilder) -> RequestBuilder {
        match basic_auth_parts(&self.credentials) {
            Some((username, password)) => request.basic_auth(username, Some(password)),
            None => request,
        }
    }

    fn execute(request: RequestBuilder, url: &str) -> Result<Response> {
        request.send().map_err(|e| Error::OperationFailed {
            operation: "registry_request".to_string(),
            cause: format!("{url}: {e}"),
        })
    }

    fn cached_token(&self, scope_key: &str) -> Option<String> {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(scope_key)
            .cloned()
    }

    fn store_token(&self, scope_key: &str, token: Option<String>) {
        let mut tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        match token {
            Some(token) => tokens.insert(scope_key.to_string(), token),
            None => tokens.remove(scope_key),
        };
    }

    /// Sends a request, answering a bearer challenge once if one is returned.
    fn send(
        &self,
        method: Method,
        url: &str,
        scope_key: &str,
        accept: Option<&str>,
    ) -> Result<Response> {
        if let Some(token) = self.cached_token(scope_key) {
            let response = Self::execute(
                self.request(method.clone(), url, accept).bearer_auth(&token),
                url,
            )?;
            if response.status() != StatusCode::UNAUTHORIZED {
                return Ok(response);
            }
            trace!(scope_key, "Cached bearer token rejected");
            self.store_token(scope_key, None);
        }

        let response = Self::execute(
            self.with_basic_auth(self.request(method.clone(), url, accept)),
            url,
        )?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(challenge) = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_bearer_challenge)
        else {
            return Ok(response);
        };

        let token = self.fetch_token(&challenge)?;
        self.store_token(scope_key, Some(token.clone()));
        Self::execute(self.request(method, url, accept).bearer_auth(&token), url)
    }

    /// Requests a bearer token from the challenge realm.
    fn fetch_token(&self, challenge: &BearerChallenge) -> Result<String> {
        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(service) = &challenge.service {
            query.push(("service", service.as_str()));
        }
        if let Some(scope) = &challenge.scope {
            query.push(("scope", scope.as_str()));
        }
        if !self.credentials.is_anonymous() {
            query.push(("account", self.credentials.username.as_str()));
        }

        debug!(realm = %challenge.realm, scope = ?challenge.scope, "Requesting bearer token");
        let request = self.with_basic_auth(self.client.get(challenge.realm.as_str()).query(&query));
        let response = Self::execute(request, &challenge.realm)?;

        if !response.status().is_success() {
            return Err(Error::Unauthorized(format!(
                "token request to {} failed: {}",
                challenge.realm,
                response.status()
            )));
        }

        let body: TokenResponse = response.json().map_err(|e| Error::Unauthorized(format!(
            "invalid token response from {}: {e}",
            challenge.realm
        )))?;

        body.token
            .or(body.access_token)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| Error::Unauthorized(format!("empty token from {}", challenge.realm)))
    }

    /// Fetches every page of a paginated listing endpoint.
    fn paginate<T, F>(&self, first: String, scope_key: &str, mut extract: F) -> Result<Vec<String>>
    where
        T: for<'de> Deserialize<'de>,
        F: FnMut(T) -> Vec<String>,
    {
        let mut items = Vec::new();
        let mut next = Some(first);

        while let Some(url) = next.take() {
            let response = self.send(Method::GET, &url, scope_key, None)?;
            let response = check_status(response, "list", &url)?;

            next = response
                .headers()
                .get(header::LINK)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_next_link)
                .map(|link| resolve_link(&url, &link))
                .transpose()?;

            let page: T = response.json().map_err(|e| Error::OperationFailed {
                operation: "decode_listing".to_string(),
                cause: format!("{url}: {e}"),
            })?;
            items.extend(extract(page));
        }

        Ok(items)
    }

    fn list_repositories(&self) -> Result<Vec<String>> {
        let url = format!("{}/v2/_catalog?n={PAGE_SIZE}", self.base_url);
        self.paginate(url, "catalog", |page: CatalogResponse| {
            page.repositories.unwrap_or_default()
        })
    }

    fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        let url = format!("{}/v2/{repository}/tags/list?n={PAGE_SIZE}", self.base_url);
        self.paginate(url, repository, |page: TagsResponse| {
            page.tags.unwrap_or_default()
        })
    }

    fn fetch_config_created(&self, repository: &str, digest: &str) -> Result<DateTime<Utc>> {
        let url = format!("{}/v2/{repository}/blobs/{digest}", self.base_url);
        let response = self.send(Method::GET, &url, repository, None)?;
        let response = check_status(response, "fetch_config_blob", &format!("{repository}@{digest}"))?;

        let config: ImageConfig = response.json().map_err(|e| Error::OperationFailed {
            operation: "decode_config_blob".to_string(),
            cause: format!("{repository}@{digest}: {e}"),
        })?;

        config.created.ok_or_else(|| Error::OperationFailed {
            operation: "decode_config_blob".to_string(),
            cause: format!("{repository}@{digest}: config has no creation time"),
        })
    }
}

impl RegistryInventorySource for HttpRegistryClient {
    fn registry_host(&self) -> &str {
        &self.host
    }

    #[instrument(skip(self), fields(operation = "list", backend = "registry", registry = %self.host))]
    fn list_repositories_and_tags(&self) -> Result<Vec<(String, String)>> {
        let start = Instant::now();
        let result = (|| -> Result<Vec<(String, String)>> {
            let mut inventory = Vec::new();
            for repository in self.list_repositories()? {
                let tags = self.list_tags(&repository)?;
                trace!(repository = %repository, tags = tags.len(), "Listed tags");
                inventory.extend(tags.into_iter().map(|tag| (repository.clone(), tag)));
            }
            Ok(inventory)
        })();
        record_request_metrics("list", start, result.is_ok());
        result
    }

    #[instrument(skip(self), fields(operation = "fetch_manifest", backend = "registry"))]
    fn fetch_manifest_metadata(&self, repository: &str, tag: &str) -> Result<ManifestMetadata> {
        let start = Instant::now();
        let result = (|| -> Result<ManifestMetadata> {
            let subject = format!("{repository}:{tag}");
            let url = format!("{}/v2/{repository}/manifests/{tag}", self.base_url);
            let response = self.send(Method::GET, &url, repository, Some(ACCEPT_MANIFEST))?;
            let response = check_status(response, "fetch_manifest", &subject)?;

            let header_digest = digest_header(&response);
            let body = response.bytes().map_err(|e| Error::OperationFailed {
                operation: "fetch_manifest".to_string(),
                cause: format!("{subject}: {e}"),
            })?;
            let digest = header_digest.unwrap_or_else(|| content_digest(&body));

            let manifest: ImageManifest =
                serde_json::from_slice(&body).map_err(|e| Error::OperationFailed {
                    operation: "decode_manifest".to_string(),
                    cause: format!("{subject}: {e}"),
                })?;
            let config = manifest.config.ok_or_else(|| Error::OperationFailed {
                operation: "decode_manifest".to_string(),
                cause: format!("{subject}: manifest has no config descriptor"),
            })?;

            let total_size_bytes = manifest
                .layers
                .iter()
                .fold(config.size, |total, layer| total.saturating_add(layer.size));
            let created_at = self.fetch_config_created(repository, &config.digest)?;

            Ok(ManifestMetadata {
                digest,
                created_at,
                total_size_bytes,
            })
        })();
        record_request_metrics("fetch_manifest", start, result.is_ok());
        result
    }

    #[instrument(skip(self), fields(operation = "manifest_digest", backend = "registry"))]
    fn manifest_digest(&self, repository: &str, tag: &str) -> Result<String> {
        let start = Instant::now();
        let result = (|| -> Result<String> {
            let subject = format!("{repository}:{tag}");
            let url = format!("{}/v2/{repository}/manifests/{tag}", self.base_url);
            let response = self.send(Method::HEAD, &url, repository, Some(ACCEPT_MANIFEST))?;
            let response = check_status(response, "manifest_digest", &subject)?;

            digest_header(&response).ok_or_else(|| Error::OperationFailed {
                operation: "manifest_digest".to_string(),
                cause: format!("{subject}: registry sent no {DIGEST_HEADER} header"),
            })
        })();
        record_request_metrics("manifest_digest", start, result.is_ok());
        result
    }

    #[instrument(skip(self), fields(operation = "delete", backend = "registry"))]
    fn delete_manifest(&self, repository: &str, digest: &str) -> Result<()> {
        let start = Instant::now();
        let url = format!("{}/v2/{repository}/manifests/{digest}", self.base_url);
        let scope_key = format!("{repository}#delete");
        let result = self
            .send(Method::DELETE, &url, &scope_key, None)
            .and_then(|response| {
                check_status(response, "delete_manifest", &format!("{repository}@{digest}"))
            })
            .map(|_| ());
        record_request_metrics("delete", start, result.is_ok());
        result
    }
}

/// Maps a non-success response to the crate error taxonomy.
fn check_status(response: Response, operation: &str, subject: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    match status {
        StatusCode::NOT_FOUND => Err(Error::NotFound(subject.to_string())),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::Unauthorized(format!(
            "{operation} {subject}: {status}"
        ))),
        _ => {
            let mut body = response.text().unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut end = MAX_ERROR_BODY;
                while !body.is_char_boundary(end) {
                    end -= 1;
                }
                body.truncate(end);
            }
            Err(Error::OperationFailed {
                operation: operation.to_string(),
                cause: format!("{subject}: {status} {}", body.trim()),
            })
        },
    }
}

fn digest_header(response: &Response) -> Option<String> {
    response
        .headers()
        .get(DIGEST_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Computes the `sha256:` digest of a manifest body.
fn content_digest(body: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(body)))
}

/// Resolves a (usually relative) `Link` target against the current page URL.
fn resolve_link(current: &str, link: &str) -> Result<String> {
    Url::parse(current)
        .and_then(|base| base.join(link))
        .map(String::from)
        .map_err(|e| Error::OperationFailed {
            operation: "follow_pagination".to_string(),
            cause: format!("{link}: {e}"),
        })
}

fn record_request_metrics(operation: &'static str, start: Instant, success: bool) {
    let status = if success { "success" } else { "error" };
    metrics::counter!(
        "registry_requests_total",
        "operation" => operation,
        "status" => status
    )
    .increment(1);
    metrics::histogram!(
        "registry_request_duration_ms",
        "operation" => operation,
        "status" => status
    )
    .record(start.elapsed().as_secs_f64() * 1000.0);
}

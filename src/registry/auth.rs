//! Registry credential resolution.

use crate::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::fmt;
use std::process::Command;
use tracing::{debug, instrument};

/// Username and password presented to the registry.
#[derive(Clone)]
pub struct Credentials {
    /// Registry username. Empty means anonymous access.
    pub username: String,
    /// Registry password or token.
    pub password: SecretString,
}

impl Credentials {
    /// Creates credentials from a username and password.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    /// Credentials for registries that allow anonymous access.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::new("", "")
    }

    /// Returns `true` when no username is set.
    #[must_use]
    pub const fn is_anonymous(&self) -> bool {
        self.username.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Produces registry credentials at startup.
pub trait CredentialResolver {
    /// Resolves the credentials to use for this run.
    ///
    /// # Errors
    ///
    /// Returns an error if credentials cannot be obtained; the run cannot
    /// continue without them.
    fn resolve(&self) -> Result<Credentials>;
}

/// Credentials taken verbatim from configuration.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    credentials: Credentials,
}

impl StaticCredentials {
    /// Wraps optional configured values. Missing values resolve to anonymous access.
    #[must_use]
    pub fn new(username: Option<String>, password: Option<SecretString>) -> Self {
        Self {
            credentials: Credentials {
                username: username.unwrap_or_default(),
                password: password.unwrap_or_else(|| SecretString::from(String::new())),
            },
        }
    }
}

impl CredentialResolver for StaticCredentials {
    fn resolve(&self) -> Result<Credentials> {
        Ok(self.credentials.clone())
    }
}

/// `aws ecr get-authorization-token` output.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizationTokenOutput {
    authorization_data: Vec<AuthorizationData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizationData {
    authorization_token: String,
}

/// Exchanges the ambient AWS identity for an ECR registry password.
///
/// Runs the AWS CLI, so the usual `AWS_PROFILE`, `AWS_REGION` and credential
/// files apply.
#[derive(Debug, Clone)]
pub struct EcrCredentials {
    program: String,
    region: Option<String>,
}

impl Default for EcrCredentials {
    fn default() -> Self {
        Self {
            program: "aws".to_string(),
            region: None,
        }
    }
}

impl EcrCredentials {
    /// Creates a resolver using the `aws` binary from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a different AWS CLI binary.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Pins the AWS region instead of relying on the environment.
    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }
}

impl CredentialResolver for EcrCredentials {
    #[instrument(skip(self), fields(operation = "resolve_credentials", backend = "ecr"))]
    fn resolve(&self) -> Result<Credentials> {
        let mut command = Command::new(&self.program);
        command.args(["ecr", "get-authorization-token", "--output", "json"]);
        if let Some(region) = &self.region {
            command.args(["--region", region.as_str()]);
        }

        debug!(program = %self.program, "Requesting ECR authorization token");
        let output = command.output().map_err(|e| Error::OperationFailed {
            operation: "ecr_get_authorization_token".to_string(),
            cause: format!("failed to run {}: {e}", self.program),
        })?;

        if !output.status.success() {
            return Err(Error::Unauthorized(format!(
                "ecr get-authorization-token exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        decode_authorization_token(&output.stdout)
    }
}

/// Decodes the first authorization token of a `get-authorization-token` response.
///
/// The token is base64 of `username:password`.
pub(crate) fn decode_authorization_token(json: &[u8]) -> Result<Credentials> {
    let parsed: AuthorizationTokenOutput =
        serde_json::from_slice(json).map_err(|e| Error::OperationFailed {
            operation: "parse_ecr_token_response".to_string(),
            cause: e.to_string(),
        })?;

    let token = parsed
        .authorization_data
        .first()
        .map(|data| data.authorization_token.as_str())
        .ok_or_else(|| Error::Unauthorized("ECR returned no authorization data".to_string()))?;

    let decoded = STANDARD
        .decode(token.trim())
        .map_err(|e| Error::Unauthorized(format!("invalid ECR token encoding: {e}")))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|e| Error::Unauthorized(format!("invalid ECR token encoding: {e}")))?;

    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| Error::Unauthorized("ECR token is not username:password".to_string()))?;

    Ok(Credentials {
        username: username.to_string(),
        password: SecretString::from(password.to_string()),
    })
}

/// Returns the username and password for HTTP basic auth, or `None` when anonymous.
pub(crate) fn basic_auth_parts(credentials: &Credentials) -> Option<(&str, &str)> {
    if credentials.is_anonymous() {
        return None;
    }
    Some((
        credentials.username.as_str(),
        credentials.password.expose_secret(),
    ))
}

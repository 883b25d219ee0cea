//! Configuration management.
//!
//! Settings are layered, lowest precedence first:
//!
//! 1. Built-in defaults
//! 2. TOML config file (`--config`, `REGCLEAN_CONFIG_PATH`, or the platform
//!    config dir, e.g. `~/.config/regclean/config.toml`)
//! 3. Environment variables and CLI flags, applied as [`ConfigOverrides`]
//!
//! ```toml
//! registry_url = "https://registry.example.com"
//! registry_username = "robot"
//! contexts = ["prod", "staging"]
//!
//! [retention]
//! min_age_days = 30
//! exclude_name_filters = ["base-images/"]
//!
//! [cache]
//! backend = "sqlite"
//! lock_timeout_ms = 1000
//! ```

use crate::gc::RetentionFilterConfig;
use crate::registry::{CredentialResolver, EcrCredentials, StaticCredentials};
use crate::storage::LockOptions;
use crate::storage::lock::{DEFAULT_LOCK_POLL_INTERVAL, DEFAULT_LOCK_TIMEOUT};
use crate::{Error, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "REGCLEAN_CONFIG_PATH";

/// Application name used for config and cache directories.
const APP_NAME: &str = "regclean";

/// Cache directory used when no platform cache dir can be determined.
const FALLBACK_CACHE_DIR: &str = ".cache";

/// Metadata cache backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheBackendKind {
    /// One file per cache key.
    #[default]
    Filesystem,
    /// Single `SQLite` database file.
    Sqlite,
}

impl CacheBackendKind {
    /// Returns the configuration name of the backend.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Filesystem => "filesystem",
            Self::Sqlite => "sqlite",
        }
    }
}

impl FromStr for CacheBackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "filesystem" | "fs" | "disk" => Ok(Self::Filesystem),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(Error::InvalidInput(format!(
                "unknown cache backend '{other}' (expected 'filesystem' or 'sqlite')"
            ))),
        }
    }
}

impl fmt::Display for CacheBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata cache settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    /// Active backend.
    pub backend: CacheBackendKind,
    /// Directory holding cache files or the database.
    pub dir: PathBuf,
    /// Maximum wait for a cache lock.
    pub lock_timeout: Duration,
    /// Delay between lock attempts (filesystem backend).
    pub lock_poll_interval: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::default(),
            dir: default_cache_dir(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            lock_poll_interval: DEFAULT_LOCK_POLL_INTERVAL,
        }
    }
}

impl CacheSettings {
    /// Returns the lock bounds for the filesystem backend.
    #[must_use]
    pub const fn lock_options(&self) -> LockOptions {
        LockOptions {
            timeout: self.lock_timeout,
            poll_interval: self.lock_poll_interval,
        }
    }
}

/// Main configuration for regclean.
#[derive(Debug, Clone, Default)]
pub struct RegcleanConfig {
    /// Registry base URL, e.g. `https://registry.example.com`.
    pub registry_url: Option<String>,
    /// Registry username.
    pub registry_username: Option<String>,
    /// Registry password.
    pub registry_password: Option<SecretString>,
    /// Fetch registry credentials from AWS ECR.
    pub aws: bool,
    /// Kubeconfig path. `None` leaves the choice to `kubectl`.
    pub kubeconfig: Option<PathBuf>,
    /// Kubernetes contexts to scan. Empty means the current context.
    pub contexts: Vec<String>,
    /// Retention rules.
    pub retention: RetentionFilterConfig,
    /// Metadata cache settings.
    pub cache: CacheSettings,
}

/// Configuration file structure (for TOML parsing).
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    /// Registry URL.
    pub registry_url: Option<String>,
    /// Registry username.
    pub registry_username: Option<String>,
    /// Registry password.
    pub registry_password: Option<String>,
    /// Use AWS ECR credentials.
    pub aws: Option<bool>,
    /// Kubeconfig path.
    pub kubeconfig: Option<String>,
    /// Kubernetes contexts.
    pub contexts: Option<Vec<String>>,
    /// Retention section.
    pub retention: Option<ConfigFileRetention>,
    /// Cache section.
    pub cache: Option<ConfigFileCache>,
}

/// Retention section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileRetention {
    /// Minimum age in days.
    pub min_age_days: Option<u32>,
    /// Repository substrings that are never deleted.
    pub exclude_name_filters: Option<Vec<String>>,
    /// Repository substrings that may be deleted.
    pub include_name_filters: Option<Vec<String>>,
}

/// Cache section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileCache {
    /// Backend name.
    pub backend: Option<String>,
    /// Cache directory.
    pub dir: Option<String>,
    /// Lock timeout in milliseconds.
    pub lock_timeout_ms: Option<u64>,
    /// Lock poll interval in milliseconds.
    pub lock_poll_interval_ms: Option<u64>,
}

/// Values from environment variables and CLI flags.
///
/// `None` leaves the underlying setting untouched.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Registry URL.
    pub registry_url: Option<String>,
    /// Registry username.
    pub registry_username: Option<String>,
    /// Registry password.
    pub registry_password: Option<SecretString>,
    /// Use AWS ECR credentials (only ever switches it on).
    pub aws: bool,
    /// Kubeconfig path.
    pub kubeconfig: Option<PathBuf>,
    /// Kubernetes contexts.
    pub contexts: Option<Vec<String>>,
    /// Minimum age in days.
    pub min_age_days: Option<u32>,
    /// Exclude name filters.
    pub exclude_name_filters: Option<Vec<String>>,
    /// Include name filters.
    pub include_name_filters: Option<Vec<String>>,
    /// Cache backend.
    pub cache_backend: Option<CacheBackendKind>,
    /// Cache directory.
    pub cache_dir: Option<PathBuf>,
}

impl RegcleanConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::OperationFailed {
            operation: "read_config_file".to_string(),
            cause: format!("{}: {e}", path.display()),
        })?;

        Self::from_toml(&contents)
            .map_err(|e| Error::InvalidInput(format!("{}: {e}", path.display())))
    }

    /// Parses configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid configuration.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(contents).map_err(|e| Error::InvalidInput(e.to_string()))?;
        Self::from_config_file(file)
    }

    /// Loads configuration from `path`, `REGCLEAN_CONFIG_PATH`, or the
    /// default location, in that order.
    ///
    /// A missing file at the default location yields the defaults; an explicit
    /// path that cannot be read is an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the chosen file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from_file(path);
        }

        if let Some(path) = std::env::var_os(CONFIG_PATH_ENV).filter(|p| !p.is_empty()) {
            return Self::load_from_file(Path::new(&path));
        }

        match default_config_path() {
            Some(path) if path.exists() => {
                tracing::debug!(path = %path.display(), "Loading default config file");
                Self::load_from_file(&path)
            },
            _ => Ok(Self::default()),
        }
    }

    /// Converts a `ConfigFile` to `RegcleanConfig`.
    fn from_config_file(file: ConfigFile) -> Result<Self> {
        let mut config = Self::default();

        config.registry_url = file.registry_url.filter(|url| !url.trim().is_empty());
        config.registry_username = file.registry_username;
        config.registry_password = file.registry_password.map(SecretString::from);
        config.aws = file.aws.unwrap_or(false);
        config.kubeconfig = file.kubeconfig.map(PathBuf::from);
        if let Some(contexts) = file.contexts {
            config.contexts = split_list(&contexts);
        }

        if let Some(retention) = file.retention {
            if let Some(days) = retention.min_age_days {
                config.retention.min_age_days = days;
            }
            if let Some(filters) = retention.exclude_name_filters {
                config.retention.exclude_name_patterns = split_list(&filters);
            }
            if let Some(filters) = retention.include_name_filters {
                config.retention.include_name_patterns = split_list(&filters);
            }
        }

        if let Some(cache) = file.cache {
            if let Some(backend) = cache.backend {
                config.cache.backend = backend.parse()?;
            }
            if let Some(dir) = cache.dir {
                config.cache.dir = PathBuf::from(dir);
            }
            if let Some(ms) = cache.lock_timeout_ms {
                config.cache.lock_timeout = Duration::from_millis(ms);
            }
            if let Some(ms) = cache.lock_poll_interval_ms {
                config.cache.lock_poll_interval = Duration::from_millis(ms.max(1));
            }
        }

        Ok(config)
    }

    /// Applies environment and CLI values on top of this configuration.
    #[must_use]
    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        if let Some(url) = overrides.registry_url.filter(|url| !url.trim().is_empty()) {
            self.registry_url = Some(url);
        }
        if overrides.registry_username.is_some() {
            self.registry_username = overrides.registry_username;
        }
        if overrides.registry_password.is_some() {
            self.registry_password = overrides.registry_password;
        }
        self.aws |= overrides.aws;
        if overrides.kubeconfig.is_some() {
            self.kubeconfig = overrides.kubeconfig;
        }
        if let Some(contexts) = overrides.contexts {
            self.contexts = split_list(&contexts);
        }
        if let Some(days) = overrides.min_age_days {
            self.retention.min_age_days = days;
        }
        if let Some(filters) = overrides.exclude_name_filters {
            self.retention.exclude_name_patterns = split_list(&filters);
        }
        if let Some(filters) = overrides.include_name_filters {
            self.retention.include_name_patterns = split_list(&filters);
        }
        if let Some(backend) = overrides.cache_backend {
            self.cache.backend = backend;
        }
        if let Some(dir) = overrides.cache_dir {
            self.cache.dir = dir;
        }
        self
    }

    /// Returns the registry URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if no registry URL is configured.
    pub fn require_registry_url(&self) -> Result<&str> {
        self.registry_url.as_deref().ok_or_else(|| {
            Error::InvalidInput(
                "a registry URL is required (--registry-url or REGCLEAN_REGISTRY_URL)".to_string(),
            )
        })
    }

    /// Returns the credential resolver selected by this configuration.
    #[must_use]
    pub fn credential_resolver(&self) -> Box<dyn CredentialResolver> {
        if self.aws {
            Box::new(EcrCredentials::new())
        } else {
            Box::new(StaticCredentials::new(
                self.registry_username.clone(),
                self.registry_password.clone(),
            ))
        }
    }
}

/// Trims list entries and drops empty ones.
///
/// Entries may themselves be comma separated.
#[must_use]
pub fn split_list(values: &[String]) -> Vec<String> {
    values
        .iter()
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect()
}

/// Returns the platform cache directory for regclean.
#[must_use]
pub fn default_cache_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", APP_NAME).map_or_else(
        || PathBuf::from(FALLBACK_CACHE_DIR),
        |dirs| dirs.cache_dir().to_path_buf(),
    )
}

/// Returns the default config file path, e.g. `~/.config/regclean/config.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    directories::BaseDirs::new()
        .map(|dirs| dirs.config_dir().join(APP_NAME).join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = RegcleanConfig::new();
        assert_eq!(config.retention.min_age_days, 30);
        assert_eq!(config.cache.backend, CacheBackendKind::Filesystem);
        assert_eq!(config.cache.lock_timeout, Duration::from_secs(1));
        assert!(config.cache.dir.ends_with("regclean") || config.cache.dir.ends_with(".cache"));
        assert!(config.registry_url.is_none());
        assert!(!config.aws);
    }

    #[test]
    fn test_from_toml() {
        let config = RegcleanConfig::from_toml(
            r#"
            registry_url = "https://registry.example.com"
            registry_username = "robot"
            registry_password = "hunter2"
            contexts = ["prod", "", "staging"]

            [retention]
            min_age_days = 7
            exclude_name_filters = ["old", ""]

            [cache]
            backend = "sqlite"
            dir = "/var/cache/regclean"
            lock_timeout_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.require_registry_url().unwrap(), "https://registry.example.com");
        assert_eq!(config.registry_username.as_deref(), Some("robot"));
        assert_eq!(
            config.registry_password.as_ref().map(|p| p.expose_secret()),
            Some("hunter2")
        );
        assert_eq!(config.contexts, vec!["prod", "staging"]);
        assert_eq!(config.retention.min_age_days, 7);
        assert_eq!(config.retention.exclude_name_patterns, vec!["old"]);
        assert_eq!(config.cache.backend, CacheBackendKind::Sqlite);
        assert_eq!(config.cache.dir, PathBuf::from("/var/cache/regclean"));
        assert_eq!(config.cache.lock_timeout, Duration::from_millis(250));
        assert_eq!(config.cache.lock_poll_interval, DEFAULT_LOCK_POLL_INTERVAL);
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let result = RegcleanConfig::from_toml("[cache]\nbackend = \"redis\"\n");
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "registry_url = [").unwrap();

        let result = RegcleanConfig::load(Some(file.path()));
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let result = RegcleanConfig::load(Some(Path::new("/nonexistent/regclean.toml")));
        assert!(matches!(result, Err(Error::OperationFailed { .. })));
    }

    #[test]
    fn test_load_explicit_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "aws = true\n[retention]\ninclude_name_filters = [\"ci/\"]").unwrap();

        let config = RegcleanConfig::load(Some(file.path())).unwrap();
        assert!(config.aws);
        assert_eq!(config.retention.include_name_patterns, vec!["ci/"]);
    }

    #[test]
    fn test_overrides_take_precedence() {
        let base = RegcleanConfig::from_toml(
            "registry_url = \"https://a.example.com\"\n[retention]\nmin_age_days = 7\n",
        )
        .unwrap();

        let config = base.with_overrides(ConfigOverrides {
            registry_url: Some("https://b.example.com".to_string()),
            min_age_days: Some(0),
            exclude_name_filters: Some(vec!["old,".to_string(), " base ".to_string()]),
            cache_backend: Some(CacheBackendKind::Sqlite),
            ..ConfigOverrides::default()
        });

        assert_eq!(config.registry_url.as_deref(), Some("https://b.example.com"));
        assert_eq!(config.retention.min_age_days, 0);
        assert_eq!(config.retention.exclude_name_patterns, vec!["old", "base"]);
        assert_eq!(config.cache.backend, CacheBackendKind::Sqlite);
    }

    #[test]
    fn test_unset_overrides_keep_file_values() {
        let base = RegcleanConfig::from_toml("registry_username = \"robot\"\ncontexts = [\"prod\"]\n")
            .unwrap();
        let config = base.with_overrides(ConfigOverrides::default());
        assert_eq!(config.registry_username.as_deref(), Some("robot"));
        assert_eq!(config.contexts, vec!["prod"]);
    }

    #[test]
    fn test_missing_registry_url() {
        assert!(matches!(
            RegcleanConfig::new().require_registry_url(),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!("SQLite".parse::<CacheBackendKind>().unwrap(), CacheBackendKind::Sqlite);
        assert_eq!(
            "filesystem".parse::<CacheBackendKind>().unwrap(),
            CacheBackendKind::Filesystem
        );
        assert_eq!(CacheBackendKind::Sqlite.to_string(), "sqlite");
        assert!("memory".parse::<CacheBackendKind>().is_err());
    }

    #[test]
    fn test_split_list() {
        let values = vec!["a,b".to_string(), String::new(), " c ".to_string()];
        assert_eq!(split_list(&values), vec!["a", "b", "c"]);
    }
}

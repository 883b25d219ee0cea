//! Regclean CLI.
//!
//! Deletes registry images that no Kubernetes cluster is running.

// Allow print_stdout/stderr in main binary for CLI output
#![allow(clippy::print_stdout)]
#![allow(clippy::print_stderr)]

use clap::Parser;
use regclean::cli::{StdinConfirm, render_repository_counts, render_summary};
use regclean::cluster::KubectlImageSource;
use regclean::config::{CacheBackendKind, ConfigOverrides, RegcleanConfig};
use regclean::gc::DeletionOptions;
use regclean::observability::{self, LogFormat, LoggingConfig};
use regclean::registry::{CredentialResolver, HttpRegistryClient};
use regclean::services::{CleanupOptions, CleanupService};
use regclean::storage::open_cache;
use secrecy::SecretString;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// Regclean - delete registry images no cluster is running.
#[derive(Parser)]
#[command(name = "regclean")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path.
    #[arg(short, long, env = "REGCLEAN_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Kubernetes contexts to scan (comma separated). Defaults to the current context.
    #[arg(long, env = "REGCLEAN_CONTEXTS", value_delimiter = ',')]
    contexts: Option<Vec<String>>,

    /// Path to the kubeconfig file.
    #[arg(long, env = "REGCLEAN_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Registry base URL, e.g. `https://registry.example.com`.
    #[arg(long, env = "REGCLEAN_REGISTRY_URL")]
    registry_url: Option<String>,

    /// Registry username.
    #[arg(long, env = "REGCLEAN_REGISTRY_USERNAME")]
    registry_username: Option<String>,

    /// Registry password.
    #[arg(long, env = "REGCLEAN_REGISTRY_PASSWORD", hide_env_values = true)]
    registry_password: Option<String>,

    /// Fetch registry credentials from AWS ECR.
    #[arg(long, env = "REGCLEAN_AWS")]
    aws: bool,

    /// Report what would be deleted without deleting anything.
    #[arg(long, env = "REGCLEAN_DRY_RUN")]
    dry_run: bool,

    /// Delete without asking for each image.
    #[arg(long, env = "REGCLEAN_YOLO")]
    yolo: bool,

    /// Keep images younger than this many days.
    #[arg(long, env = "REGCLEAN_MIN_AGE")]
    min_age: Option<u32>,

    /// Keep images whose repository path contains any of these substrings.
    #[arg(long, env = "REGCLEAN_EXCLUDE_NAME_FILTERS", value_delimiter = ',')]
    exclude_name_filters: Option<Vec<String>>,

    /// Only consider images whose repository path contains one of these substrings.
    #[arg(long, env = "REGCLEAN_INCLUDE_NAME_FILTERS", value_delimiter = ',')]
    include_name_filters: Option<Vec<String>>,

    /// Metadata cache backend (`filesystem` or `sqlite`).
    #[arg(long, env = "REGCLEAN_CACHE_BACKEND")]
    cache_backend: Option<CacheBackendKind>,

    /// Metadata cache directory.
    #[arg(long, env = "REGCLEAN_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, env = "REGCLEAN_VERBOSITY", default_value = observability::DEFAULT_LEVEL)]
    verbosity: String,

    /// Log output format (pretty or json).
    #[arg(long, env = "REGCLEAN_LOG_FORMAT", default_value = "pretty")]
    log_format: LogFormat,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            registry_url: self.registry_url.clone(),
            registry_username: self.registry_username.clone(),
            registry_password: self.registry_password.clone().map(SecretString::from),
            aws: self.aws,
            kubeconfig: self.kubeconfig.clone(),
            contexts: self.contexts.clone(),
            min_age_days: self.min_age,
            exclude_name_filters: self.exclude_name_filters.clone(),
            include_name_filters: self.include_name_filters.clone(),
            cache_backend: self.cache_backend,
            cache_dir: self.cache_dir.clone(),
        }
    }

    const fn deletion_options(&self) -> DeletionOptions {
        DeletionOptions {
            dry_run: self.dry_run,
            yolo: self.yolo,
        }
    }
}

/// Main entry point.
fn main() -> ExitCode {
    let cli = Cli::parse();

    let logging = match LoggingConfig::from_env(&cli.verbosity, cli.log_format) {
        Ok(logging) => logging,
        Err(e) => {
            eprintln!("Failed to configure logging: {e}");
            return ExitCode::FAILURE;
        },
    };
    if let Err(e) = observability::init(logging) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let config = match RegcleanConfig::load(cli.config.as_deref()) {
        Ok(config) => config.with_overrides(cli.overrides()),
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        },
    };

    match run(&config, cli.deletion_options()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        },
    }
}

fn run(config: &RegcleanConfig, deletion: DeletionOptions) -> regclean::Result<()> {
    let url = config.require_registry_url()?;
    let credentials = config.credential_resolver().resolve()?;
    let registry = HttpRegistryClient::connect(url, credentials)?;
    tracing::info!(registry = registry.base_url(), "Connected to registry");

    let cache = open_cache(&config.cache)?;
    let cluster = KubectlImageSource::new(config.kubeconfig.clone());

    let service = CleanupService::new(
        Arc::new(cluster),
        Arc::new(registry),
        cache,
        Arc::new(StdinConfirm::stdio()),
        CleanupOptions {
            contexts: config.contexts.clone(),
            retention: config.retention.clone(),
            deletion,
        },
    );

    let plan = service.plan()?;
    if !plan.candidates.is_empty() {
        print!("{}", render_repository_counts(&plan.candidates));
    }

    let summary = service.execute(&plan)?;
    print!("{}", render_summary(&summary));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_name_filter_help_describes_repository_matching() {
        let command = Cli::command();
        for id in ["exclude_name_filters", "include_name_filters"] {
            let arg = command
                .get_arguments()
                .find(|arg| arg.get_id().as_str() == id)
                .unwrap();
            let help = arg.get_help().unwrap().to_string();
            assert!(help.contains("repository path"), "{id}: {help}");
        }
    }

    #[test]
    fn test_name_filters_split_on_commas() {
        let cli = Cli::try_parse_from([
            "regclean",
            "--exclude-name-filters",
            "base-images/,old",
            "--include-name-filters",
            "ci/",
        ])
        .unwrap();

        let overrides = cli.overrides();
        assert_eq!(
            overrides.exclude_name_filters,
            Some(vec!["base-images/".to_string(), "old".to_string()])
        );
        assert_eq!(overrides.include_name_filters, Some(vec!["ci/".to_string()]));
    }
}

//! Observability and telemetry.
//!
//! Logs go to stderr through `tracing-subscriber`, leaving stdout for reports.
//! The filter comes from `RUST_LOG` when set, otherwise from the verbosity
//! level given on the command line. Metrics are emitted through the `metrics`
//! facade and are no-ops unless a recorder is installed by the embedding
//! application.

use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Default verbosity when neither `RUST_LOG` nor a level is given.
pub const DEFAULT_LEVEL: &str = "info";

/// Accepted verbosity levels.
const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

static OBSERVABILITY_INIT: OnceLock<()> = OnceLock::new();

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable output.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(Error::InvalidInput(format!(
                "unknown log format '{other}' (expected 'pretty' or 'json')"
            ))),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pretty => "pretty",
            Self::Json => "json",
        })
    }
}

/// Logging configuration.
#[derive(Debug)]
pub struct LoggingConfig {
    /// Event filter.
    pub filter: EnvFilter,
    /// Output format.
    pub format: LogFormat,
}

impl LoggingConfig {
    /// Builds the configuration from `RUST_LOG`, falling back to `level`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an unknown level or an invalid
    /// `RUST_LOG` directive.
    pub fn from_env(level: &str, format: LogFormat) -> Result<Self> {
        let filter = match std::env::var("RUST_LOG") {
            Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(&directives)
                .map_err(|e| Error::InvalidInput(format!("invalid RUST_LOG '{directives}': {e}")))?,
            _ => level_filter(level)?,
        };
        Ok(Self { filter, format })
    }
}

/// Builds a filter for one of `trace`, `debug`, `info`, `warn`, `error`.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] for any other level.
pub fn level_filter(level: &str) -> Result<EnvFilter> {
    let level = level.trim().to_lowercase();
    let level = match level.as_str() {
        "warning" => "warn",
        "fatal" | "panic" => "error",
        other => other,
    };
    if !LEVELS.contains(&level) {
        return Err(Error::InvalidInput(format!(
            "unknown log level '{level}' (expected one of {})",
            LEVELS.join(", ")
        )));
    }
    EnvFilter::try_new(level).map_err(|e| Error::InvalidInput(e.to_string()))
}

/// Installs the global tracing subscriber.
///
/// # Errors
///
/// Returns an error if a subscriber has already been installed.
pub fn init(config: LoggingConfig) -> Result<()> {
    if OBSERVABILITY_INIT.get().is_some() {
        return Err(Error::OperationFailed {
            operation: "observability_init".to_string(),
            cause: "observability already initialized".to_string(),
        });
    }

    match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_target(true),
            )
            .with(config.filter)
            .try_init()
            .map_err(init_error)?,
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .with(config.filter)
            .try_init()
            .map_err(init_error)?,
    }

    OBSERVABILITY_INIT
        .set(())
        .map_err(|()| Error::OperationFailed {
            operation: "observability_init".to_string(),
            cause: "failed to mark observability initialized".to_string(),
        })
}

/// Helper to convert init errors.
#[allow(clippy::needless_pass_by_value)]
fn init_error(e: tracing_subscriber::util::TryInitError) -> Error {
    Error::OperationFailed {
        operation: "observability_init".to_string(),
        cause: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("trace" ; "trace")]
    #[test_case("DEBUG" ; "uppercase")]
    #[test_case("warning" ; "warning alias")]
    #[test_case("fatal" ; "fatal alias")]
    fn test_level_filter_accepts(level: &str) {
        assert!(level_filter(level).is_ok());
    }

    #[test]
    fn test_level_filter_rejects_unknown() {
        assert!(matches!(level_filter("chatty"), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("Pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!(LogFormat::Json.to_string(), "json");
        assert!("xml".parse::<LogFormat>().is_err());
    }
}

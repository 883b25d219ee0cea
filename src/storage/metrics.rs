//! Operation metrics shared by both cache backends.

use crate::{Error, Result};
use std::time::Instant;

/// A cache operation being timed.
///
/// Created before the operation runs and finished with its result, which
/// records `metadata_cache_operations_total` and
/// `metadata_cache_operation_duration_ms` labelled by backend, operation and
/// outcome.
#[derive(Debug, Clone, Copy)]
pub struct CacheOperation {
    backend: &'static str,
    operation: &'static str,
    start: Instant,
}

impl CacheOperation {
    /// Starts timing `operation` on `backend`.
    #[must_use]
    pub fn start(backend: &'static str, operation: &'static str) -> Self {
        Self {
            backend,
            operation,
            start: Instant::now(),
        }
    }

    /// Records the outcome and passes `result` through.
    pub fn finish<T>(self, result: Result<T>) -> Result<T> {
        let outcome = outcome(&result);
        metrics::counter!(
            "metadata_cache_operations_total",
            "backend" => self.backend,
            "operation" => self.operation,
            "outcome" => outcome
        )
        .increment(1);
        metrics::histogram!(
            "metadata_cache_operation_duration_ms",
            "backend" => self.backend,
            "operation" => self.operation,
            "outcome" => outcome
        )
        .record(self.start.elapsed().as_secs_f64() * 1000.0);
        result
    }
}

/// Metric label for a cache operation result.
const fn outcome<T>(result: &Result<T>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(Error::LockTimeout { .. }) => "lock_timeout",
        Err(Error::CorruptEntry { .. }) => "corrupt",
        Err(_) => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn test_outcome_labels() {
        assert_eq!(outcome(&Ok(())), "success");
        assert_eq!(
            outcome::<()>(&Err(Error::LockTimeout {
                path: PathBuf::from("/tmp/entry"),
                waited: Duration::from_secs(1),
            })),
            "lock_timeout"
        );
        assert_eq!(
            outcome::<()>(&Err(Error::CorruptEntry {
                key: "app:v1".to_string(),
                cause: "eof".to_string(),
            })),
            "corrupt"
        );
        assert_eq!(outcome::<()>(&Err(Error::NotFound("x".to_string()))), "error");
    }

    #[test]
    fn test_finish_passes_result_through() {
        // No recorder is installed in tests, so recording is a no-op.
        let result = CacheOperation::start("sqlite", "get").finish(Ok(Some(3)));
        assert_eq!(result.unwrap(), Some(3));

        let failed: Result<()> = CacheOperation::start("filesystem", "set")
            .finish(Err(Error::NotFound("app:v1".to_string())));
        assert!(failed.unwrap_err().is_not_found());
    }
}

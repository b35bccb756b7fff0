use thiserror::Error;

/// Application-wide error types for the harvester.
#[derive(Error, Debug)]
pub enum AppError {
    /// The full catalog could not be loaded. Fatal, raised before any fetch.
    #[error("Catalog unavailable: {0}")]
    CatalogUnavailable(String),

    /// A bounded wait elapsed (per-call timeout or throttle wait ceiling).
    #[error("Timed out after {0} seconds")]
    Timeout(u64),

    /// The upstream API answered with its rate-limit status.
    #[error("Rate limit exceeded")]
    RateLimited,

    /// The upstream API answered with an unexpected status.
    #[error("Upstream failure (HTTP {status}): {body}")]
    UpstreamFailure { status: u16, body: String },

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Reading or writing a local file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The throttle control task is no longer running.
    #[error("Throttle control loop has stopped")]
    ThrottleUnavailable,

    /// The fatal-error ceiling was exceeded and the run was aborted.
    #[error("aborting: too many failures ({failures} fatal errors)")]
    Aborted { failures: u64 },
}

impl AppError {
    /// Returns true if this error is raised before the pipeline starts
    /// (bad catalog, bad configuration) rather than by the run itself.
    pub fn is_pre_flight(&self) -> bool {
        matches!(
            self,
            AppError::CatalogUnavailable(_) | AppError::ConfigError(_)
        )
    }

    /// Process exit code for an error that ends the program.
    pub fn exit_code(&self) -> u8 {
        match self {
            AppError::Aborted { .. } => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pre_flight_errors() {
        assert!(AppError::CatalogUnavailable("missing".into()).is_pre_flight());
        assert!(AppError::ConfigError("bad".into()).is_pre_flight());
        assert!(!AppError::RateLimited.is_pre_flight());
        assert!(!AppError::Aborted { failures: 11 }.is_pre_flight());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(AppError::Aborted { failures: 11 }.exit_code(), 2);
        assert_eq!(AppError::CatalogUnavailable("x".into()).exit_code(), 1);
    }

    #[test]
    fn test_abort_message() {
        let msg = AppError::Aborted { failures: 11 }.to_string();
        assert!(msg.starts_with("aborting: too many failures"));
    }
}

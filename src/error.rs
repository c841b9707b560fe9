//! Error types for feedrelay.

use thiserror::Error;

use crate::feed::QuotaKind;

/// Common error type for feedrelay.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Database error.
    ///
    /// Storage errors are transient: the current operation fails, the
    /// process keeps running and the next cycle retries.
    #[error("database error: {0}")]
    Database(String),

    /// Database connection error.
    #[error("database connection error: {0}")]
    DatabaseConnection(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Validation error for user input.
    #[error("validation error: {0}")]
    Validation(String),

    /// Resource not found.
    #[error("{0} not found")]
    NotFound(String),

    /// The resource already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Admission declined by a subscription quota.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(QuotaKind),

    /// Feed fetch or parse error.
    #[error("fetch error: {0}")]
    Fetch(String),

    /// Message delivery error.
    #[error("notify error: {0}")]
    Notify(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// An update pass ran past its deadline.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Work was abandoned because shutdown was requested.
    #[error("cancelled")]
    Cancelled,
}

impl RelayError {
    /// Whether this error is a pass-level stop (deadline or shutdown).
    pub fn is_stop(&self) -> bool {
        matches!(self, RelayError::DeadlineExceeded | RelayError::Cancelled)
    }
}

// Conversion from sqlx errors
impl From<sqlx::Error> for RelayError {
    fn from(e: sqlx::Error) -> Self {
        RelayError::Database(e.to_string())
    }
}

/// Result type alias for feedrelay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = RelayError::Validation("url is empty".to_string());
        assert_eq!(err.to_string(), "validation error: url is empty");
    }

    #[test]
    fn test_not_found_error_display() {
        let err = RelayError::NotFound("feed".to_string());
        assert_eq!(err.to_string(), "feed not found");
    }

    #[test]
    fn test_quota_error_display() {
        let err = RelayError::QuotaExceeded(QuotaKind::DestinationLimit);
        assert_eq!(
            err.to_string(),
            "quota exceeded: chat is already at maximum feeds"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: RelayError = io_err.into();
        assert!(matches!(err, RelayError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_is_stop() {
        assert!(RelayError::DeadlineExceeded.is_stop());
        assert!(RelayError::Cancelled.is_stop());
        assert!(!RelayError::Fetch("timeout".to_string()).is_stop());
    }

    #[test]
    fn test_result_alias() {
        fn sample_ok() -> Result<i32> {
            Ok(42)
        }

        fn sample_err() -> Result<i32> {
            Err(RelayError::Config("test".to_string()))
        }

        assert_eq!(sample_ok().unwrap(), 42);
        assert!(sample_err().is_err());
    }
}

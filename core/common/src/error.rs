//! Common error types for DraftSync.

use thiserror::Error;

/// Top-level error type for DraftSync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The remote could not be reached (offline or transport failure).
    #[error("Network error: {0}")]
    Network(String),

    /// The remote rejected the supplied credentials.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// The remote answered with an unexpected non-2xx status.
    #[error("Remote error ({status}): {message}")]
    Remote { status: u16, message: String },

    /// A conflict resolution could not be applied.
    #[error("Resolution error: {0}")]
    Resolution(String),

    /// Device storage failed.
    #[error("Local storage error: {0}")]
    LocalStorage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Work was aborted through a cancellation token.
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration missing or malformed.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether a failed remote call may succeed if attempted again.
    ///
    /// `Auth` is never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Remote { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Remote {
            status: 503,
            message: "unavailable".to_string(),
        };
        assert_eq!(err.to_string(), "Remote error (503): unavailable");
        assert_eq!(Error::Cancelled.to_string(), "Operation cancelled");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Network("down".into()).is_retryable());
        assert!(Error::Remote {
            status: 500,
            message: String::new()
        }
        .is_retryable());
        assert!(!Error::Auth("bad token".into()).is_retryable());
        assert!(!Error::LocalStorage("disk full".into()).is_retryable());
    }
}

// Central Error Type for the Application

use thiserror::Error;

/// Application-level error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Domain error: {0}")]
    Domain(#[from] crate::domain::DomainError),

    /// User-supplied input was rejected. Surfaced to the caller; no state change.
    #[error("{0}")]
    InvalidInput(String),

    /// Store I/O failure. Logged and retried on a later tick.
    #[error("Store error: {0}")]
    Store(String),

    /// Lost a compare-and-set race; the winner's transition stands.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Lock backend failure. Contention is NOT an error, see `LockFactory`.
    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

// From implementation for infra crates (to avoid circular dependency)
impl From<String> for AppError {
    fn from(err: String) -> Self {
        AppError::Store(err)
    }
}

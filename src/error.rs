//! Error types for Sluice.

use thiserror::Error;

/// Main error type for Sluice operations.
#[derive(Error, Debug)]
pub enum SluiceError {
    /// Invalid bucket or limiter parameters
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failures reported by the persistence collaborator
    #[error("Store error: {0}")]
    Store(String),

    /// Bucket records that could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Sluice operations.
pub type Result<T> = std::result::Result<T, SluiceError>;

//! Error types for the adaptive performance layer

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the adaptive performance layer
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload or state (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration file parse error
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// Unknown cache category
    #[error("Invalid cache category: {0}")]
    InvalidCategory(String),

    /// Invalid argument at the API boundary
    #[error("Validation failed for {field}: {reason}")]
    Validation { field: String, reason: String },

    // =========================================================================
    // Worker Pool Errors
    // =========================================================================
    /// A submitted task returned an error
    #[error("Task failed: {0}")]
    TaskFailed(String),

    /// A submitted task panicked
    #[error("Task panicked: {0}")]
    TaskPanicked(String),

    /// A submitted task was cancelled before it completed
    #[error("Task cancelled")]
    TaskCancelled,

    /// The pool no longer accepts work
    #[error("Worker pool is shut down")]
    PoolShutDown,

    // =========================================================================
    // Precompute Errors
    // =========================================================================
    /// No executor registered for a strategy type
    #[error("No executor registered for strategy type: {0}")]
    ExecutorNotRegistered(String),
}

impl Error {
    /// Build a validation error for a named field
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            Error::TaskCancelled
        } else {
            Error::TaskPanicked(err.to_string())
        }
    }
}

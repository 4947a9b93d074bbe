//! Error types for CASK.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for CASK operations.
pub type Result<T> = std::result::Result<T, CaskError>;

/// Main error type for CASK.
#[derive(Error, Debug)]
pub enum CaskError {
    // Request classification errors
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    TooManyRequests(String),

    // Instance lifecycle errors
    #[error("Instance not found: {project}/{instance}")]
    InstanceNotFound { project: String, instance: String },

    #[error("Instance already exists: {project}/{instance}")]
    InstanceAlreadyExists { project: String, instance: String },

    #[error("The instance is already running")]
    InstanceAlreadyRunning,

    #[error("The instance is already stopped")]
    InstanceIsStopped,

    // Operation lock errors
    #[error("Instance is busy running a {action} operation")]
    OperationInProgress { action: String },

    /// A prior compatible operation lock completed successfully while waiting
    /// on it. Callers treat this as success.
    #[error("A matching operation has already succeeded")]
    NonReusableSucceeded,

    // Device errors
    #[error("Unsupported device type")]
    UnsupportedDevType,

    // Database errors
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Database migration failed: {reason}")]
    MigrationFailed { reason: String },

    /// Sentinel used by usage iterators to stop early; never user-visible.
    #[error("Instance list stop")]
    InstanceListStop,

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CaskError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// Whether this error classifies as a not-found condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::InstanceNotFound { .. })
    }

    /// Whether this error classifies as a conflict condition.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::InstanceAlreadyExists { .. })
    }
}

/// Wrap an `std::io::Error` with the path it occurred on.
pub fn io_error(path: impl Into<PathBuf>, source: std::io::Error) -> CaskError {
    CaskError::IoError { path: path.into(), source }
}

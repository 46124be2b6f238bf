//! Error types for the sync layer.

use thiserror::Error;

/// Main error type for sync operations.
///
/// Errors are delivered to every listener of a failed view, so the type is
/// `Clone` and carries rendered messages rather than source errors.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("Remote store error: {0}")]
    Remote(String),

    #[error("Watch on {key} failed: {reason}")]
    WatchFailed { key: String, reason: String },

    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    #[error("Write to {path} failed: {reason}")]
    WriteFailed { path: String, reason: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Component has been disposed")]
    Disposed,
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Decode(e.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Io(e.to_string())
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

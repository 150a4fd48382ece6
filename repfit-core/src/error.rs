//! Error types shared by the store, the queue and the sync engine.

use std::path::PathBuf;
use thiserror::Error;

/// A local persistence failure. Fatal to the call that produced it only.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Failed to create database directory {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt queue row {id}: {reason}")]
    CorruptRow { id: i64, reason: String },
}

/// A failure reported by the remote API.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// Timeouts, refused connections, 408/429 and 5xx answers. Worth retrying.
    #[error("Network error: {0}")]
    Transient(String),

    /// The server understood the request and refused it. Retrying won't help.
    #[error("Rejected by server ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }

    /// Classify an HTTP status that was not a success.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            408 | 429 | 500..=599 => {
                RemoteError::Transient(format!("server returned {}: {}", status, message))
            }
            _ => RemoteError::Rejected { status, message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(RemoteError::from_status(503, "down").is_retryable());
        assert!(RemoteError::from_status(500, "oops").is_retryable());
        assert!(RemoteError::from_status(429, "slow down").is_retryable());
        assert!(RemoteError::from_status(408, "timeout").is_retryable());
        assert!(!RemoteError::from_status(422, "bad title").is_retryable());
        assert!(!RemoteError::from_status(404, "gone").is_retryable());
    }

    #[test]
    fn test_rejected_display() {
        let err = RemoteError::from_status(422, "title is required");
        assert_eq!(
            err.to_string(),
            "Rejected by server (422): title is required"
        );
    }
}

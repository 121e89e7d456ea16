//! Error types for checkpoint and lock operations
//!
//! The taxonomy separates expected conditions from real failures:
//!
//! - [`CheckpointError::NotFound`] - no checkpoint yet (normal on a first run)
//! - [`CheckpointError::Corrupt`] - persisted data cannot be decoded; an
//!   operator has to inspect it, nothing here repairs it
//! - [`CheckpointError::Locked`] - contention, retriable
//! - [`CheckpointError::Validation`] - malformed caller input, never retriable
//! - [`CheckpointError::Cancelled`] - the caller's cancellation token fired

use std::path::PathBuf;
use thiserror::Error;

/// Result type for checkpoint operations
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors that can occur during checkpoint operations
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// No checkpoint exists for the key
    #[error("checkpoint not found: {module}@{version}")]
    NotFound { module: String, version: String },

    /// A persisted record exists but cannot be decoded
    #[error("corrupt checkpoint file {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Another holder owns the lock for the key
    #[error("checkpoint {module}@{version} is locked by another holder")]
    Locked { module: String, version: String },

    /// Caller input was rejected before touching storage
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Lock acquisition was cancelled by the caller
    #[error("lock acquisition for {module}@{version} was cancelled")]
    Cancelled { module: String, version: String },

    /// I/O error with the operation that failed
    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Invalid settings
    #[error("Configuration error: {0}")]
    Config(String),

    /// Encoding a record failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Input rejected at the manager boundary
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("module is required")]
    ModuleRequired,

    #[error("version is required")]
    VersionRequired,

    #[error("repo is required")]
    RepoRequired,

    #[error("branch is required")]
    BranchRequired,

    #[error("invalid status {0:?}: expected one of completed, manual-review, failed, skipped")]
    InvalidStatus(String),

    #[error("invalid path segment in {0:?}")]
    InvalidPathSegment(String),

    #[error("keep count must be at least 1")]
    InvalidKeepCount,
}

impl CheckpointError {
    /// Create an I/O error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn not_found(module: &str, version: &str) -> Self {
        Self::NotFound {
            module: module.to_string(),
            version: version.to_string(),
        }
    }

    pub(crate) fn locked(module: &str, version: &str) -> Self {
        Self::Locked {
            module: module.to_string(),
            version: version.to_string(),
        }
    }

    pub(crate) fn cancelled(module: &str, version: &str) -> Self {
        Self::Cancelled {
            module: module.to_string(),
            version: version.to_string(),
        }
    }

    /// True when no checkpoint exists yet.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True for contention, the only condition worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Locked { .. })
    }
}

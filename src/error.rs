//! Error types for the treesum library
//!
//! Errors fall into two groups. Per-entry failures ([`TreesumError::Read`],
//! [`TreesumError::Walk`]) are recovered locally by the fingerprint builder
//! and surface as warnings next to a successful result. Everything that
//! compromises a whole artifact or operation ([`TreesumError::Format`],
//! [`TreesumError::Integrity`], [`TreesumError::Config`],
//! [`TreesumError::Cancelled`]) aborts and is returned to the caller.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the treesum library
pub type Result<T> = std::result::Result<T, TreesumError>;

/// Main error type for all treesum operations
#[derive(Debug, Error)]
pub enum TreesumError {
    /// A file could not be read to completion while hashing
    #[error("Read error: {path:?}: {message}")]
    Read {
        /// File being hashed
        path: PathBuf,
        /// What went wrong
        message: String,
    },

    /// A directory entry could not be enumerated
    #[error("Walk error: {path:?}: {message}")]
    Walk {
        /// Entry path, when the walker knows it
        path: PathBuf,
        /// What went wrong
        message: String,
    },

    /// The artifact is malformed or of an unsupported version
    #[error("Format error: {0}")]
    Format(String),

    /// The artifact failed its integrity check
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Invalid configuration, rejected before any work starts
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The operation was cancelled through its cancellation token
    #[error("Operation cancelled")]
    Cancelled,

    /// I/O errors outside of per-file hashing
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors during bincode serialization/deserialization
    #[error("Bincode error: {0}")]
    Bincode(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

// Implement conversions for bincode 2.0 error types
impl From<bincode::error::DecodeError> for TreesumError {
    fn from(err: bincode::error::DecodeError) -> Self {
        TreesumError::Bincode(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for TreesumError {
    fn from(err: bincode::error::EncodeError) -> Self {
        TreesumError::Bincode(err.to_string())
    }
}

impl TreesumError {
    /// Create a read error for `path`
    pub fn read(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        TreesumError::Read {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create a walk error for `path`
    pub fn walk(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        TreesumError::Walk {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create a format error with a custom message
    pub fn format(msg: impl Into<String>) -> Self {
        TreesumError::Format(msg.into())
    }

    /// Create an integrity error with a custom message
    pub fn integrity(msg: impl Into<String>) -> Self {
        TreesumError::Integrity(msg.into())
    }

    /// Create a configuration error with a custom message
    pub fn config(msg: impl Into<String>) -> Self {
        TreesumError::Config(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        TreesumError::Internal(msg.into())
    }

    /// Check if this error is recovered per entry during a scan
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TreesumError::Read { .. } | TreesumError::Walk { .. })
    }

    /// Check if this error indicates a corrupt or incompatible artifact
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            TreesumError::Format(_) | TreesumError::Integrity(_) | TreesumError::Bincode(_)
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            TreesumError::Integrity(msg) => {
                format!(
                    "Fingerprint failed its integrity check ({}). The file is corrupt or \
                     truncated; rebuild it with 'treesum scan'.",
                    msg
                )
            }
            TreesumError::Format(msg) => {
                format!(
                    "Not a readable fingerprint ({}). Check the path or the treesum version \
                     that wrote it.",
                    msg
                )
            }
            TreesumError::Config(msg) => {
                format!("Invalid configuration: {}. Nothing was scanned.", msg)
            }
            TreesumError::Cancelled => {
                "Scan cancelled. No fingerprint was written.".to_string()
            }
            _ => self.to_string(),
        }
    }
}

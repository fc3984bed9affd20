//! Backup engine error types

use crate::store::StoreError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while creating, verifying, restoring or pruning backups
#[derive(Error, Debug)]
pub enum BackupError {
    /// The artifact could not be written; no catalog entry was created
    #[error("Failed to write backup artifact {path}: {message}")]
    ArtifactWrite { path: PathBuf, message: String },

    #[error("Checksum mismatch for {identity}: expected {expected}, found {actual}")]
    ChecksumMismatch {
        identity: String,
        expected: String,
        actual: String,
    },

    /// The catalog knows the backup but no class directory holds its file
    #[error("Backup artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Backup {0} is not in the catalog")]
    UnknownBackup(String),

    #[error("Backup {0} already exists in the catalog")]
    DuplicateIdentity(String),

    /// An adjunct section (config files, logs) could not be captured
    #[error("Failed to capture {section} section: {message}")]
    PartialSectionFailure { section: String, message: String },

    #[error("Replay failed: {0}")]
    ReplayFailure(String),

    /// Restore replay failed and so did the rollback to the safety backup
    #[error(
        "Restore of {identity} failed and rollback from safety backup {safety} also failed: {message}. \
         The live store needs operator intervention"
    )]
    InconsistentState {
        identity: String,
        safety: String,
        message: String,
    },

    #[error("Incremental chain for {identity} is broken: {message}")]
    BrokenChain { identity: String, message: String },

    #[error("Invalid backup artifact {path}: {message}")]
    InvalidArtifact { path: PathBuf, message: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Catalog error: {0}")]
    Catalog(#[from] sled::Error),

    #[error("Catalog encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),
}

impl BackupError {
    pub fn artifact_write(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::ArtifactWrite {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub fn invalid_artifact(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::InvalidArtifact {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn partial_section(section: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::PartialSectionFailure {
            section: section.into(),
            message: err.to_string(),
        }
    }
}

/// Convenient Result type for backup operations
pub type Result<T> = std::result::Result<T, BackupError>;

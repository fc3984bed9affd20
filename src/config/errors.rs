//! Error handling utilities for the command-line surface
//!
//! Library code returns `BackupError`; the binary works in anyhow and uses
//! these helpers to attach operation context.

pub use anyhow::{Context, Error, Result};

pub use crate::backup::error::BackupError;

/// Common error message formatting
pub trait ErrorMessage {
    fn to_user_message(&self) -> String;
}

impl ErrorMessage for Error {
    fn to_user_message(&self) -> String {
        format!("Error: {:#}", self)
    }
}

/// Error context builders for common operations
pub trait ErrorContextExt<T> {
    /// Add backup creation context
    fn backup_context(self, operation: &str) -> Result<T>;

    /// Add restore context
    fn restore_context(self, identity: &str) -> Result<T>;

    /// Add catalog operation context
    fn catalog_context(self, operation: &str) -> Result<T>;
}

impl<T, E> ErrorContextExt<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    fn backup_context(self, operation: &str) -> Result<T> {
        self.map_err(Into::into)
            .with_context(|| format!("Backup operation failed: {}", operation))
    }

    fn restore_context(self, identity: &str) -> Result<T> {
        self.map_err(Into::into)
            .with_context(|| format!("Restore failed for backup: {}", identity))
    }

    fn catalog_context(self, operation: &str) -> Result<T> {
        self.map_err(Into::into)
            .with_context(|| format!("Catalog operation failed: {}", operation))
    }
}

//! Primary datastore interface
//!
//! The backup engine only needs a store that can dump itself to a replayable
//! SQL script, extract rows changed since a point in time, and replay scripts
//! back into itself.

pub mod scratch;
pub mod sqlite;

pub use scratch::ScratchStore;
pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by datastore operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Table exists but does not have the columns its descriptor names
    #[error("Table {table} has no column {column}")]
    MissingColumn { table: String, column: String },

    #[error("Store connection lock poisoned")]
    Poisoned,
}

/// How a table stores its change timestamp
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampFormat {
    /// `YYYY-MM-DD HH:MM:SS[.fff]` text, as written by `CURRENT_TIMESTAMP` or
    /// `strftime('%Y-%m-%d %H:%M:%f', 'now')`
    #[default]
    Text,
    /// Integer seconds since the Unix epoch
    UnixSeconds,
}

/// Declares how to find changed rows in one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub table: String,
    pub change_timestamp_column: String,
    pub primary_key_columns: Vec<String>,
    #[serde(default)]
    pub timestamp_format: TimestampFormat,
}

impl TableDescriptor {
    pub fn new(table: &str, change_timestamp_column: &str, primary_key_columns: &[&str]) -> Self {
        Self {
            table: table.to_string(),
            change_timestamp_column: change_timestamp_column.to_string(),
            primary_key_columns: primary_key_columns.iter().map(|c| c.to_string()).collect(),
            timestamp_format: TimestampFormat::Text,
        }
    }
}

/// Handle to the live primary store
///
/// Implementations must be Send + Sync; the engine calls them from the
/// blocking thread pool.
pub trait Datastore: Send + Sync {
    /// Serialize the entire store into an ordered, replayable SQL script
    fn dump(&self) -> Result<String, StoreError>;

    /// Names of the user tables currently in the store
    fn tables(&self) -> Result<Vec<String>, StoreError>;

    /// Emit one idempotent upsert statement per row of `descriptor.table` whose
    /// change timestamp is strictly later than `anchor`.
    ///
    /// Returns an empty list when the table does not exist.
    fn upserts_since(
        &self,
        descriptor: &TableDescriptor,
        anchor: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError>;

    /// Drop every object in the store and replay a full dump
    fn replace_from(&self, script: &str) -> Result<(), StoreError>;

    /// Replay a script over the current content
    fn apply(&self, script: &str) -> Result<(), StoreError>;

    /// Close live handles so the store can be replaced
    fn detach(&self) -> Result<(), StoreError>;

    /// Reopen live handles after a replace
    fn reattach(&self) -> Result<(), StoreError>;
}

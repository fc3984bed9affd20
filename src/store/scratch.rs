//! Disposable stores for non-destructive replay tests

use super::{Datastore, SqliteStore, StoreError};
use std::path::Path;
use tempfile::TempDir;

/// An isolated SQLite store living in its own temporary directory
///
/// The database and its directory are removed when the guard is dropped,
/// whichever way the caller exits. Fields drop in declaration order, so the
/// connection is closed before the directory goes away.
pub struct ScratchStore {
    store: SqliteStore,
    dir: TempDir,
}

impl ScratchStore {
    pub fn create() -> Result<Self, StoreError> {
        let dir = tempfile::Builder::new().prefix("backup-scratch-").tempdir()?;
        let store = SqliteStore::open(dir.path().join("scratch.db"))?;
        tracing::debug!("Created scratch store in {}", dir.path().display());
        Ok(Self { store, dir })
    }

    /// Replay a full dump into the empty scratch database
    pub fn replay(&self, script: &str) -> Result<(), StoreError> {
        self.store.replace_from(script)
    }

    /// Apply an incremental delta over what was replayed so far
    pub fn apply(&self, script: &str) -> Result<(), StoreError> {
        self.store.apply(script)
    }

    /// Number of tables the replay produced
    pub fn structure_count(&self) -> Result<usize, StoreError> {
        self.store.structure_count()
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }
}

impl Drop for ScratchStore {
    fn drop(&mut self) {
        tracing::debug!("Discarding scratch store {}", self.dir.path().display());
    }
}

//! Per-record locks
//!
//! Verify and restore hold the locks of every record they read; retention only
//! `try_lock`s and leaves busy records alone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Guard over one record
pub type RecordGuard = OwnedMutexGuard<()>;

#[derive(Default)]
pub struct RecordLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl RecordLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, identity: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait for the locks of every identity
    ///
    /// Locks are taken in sorted order so two callers with overlapping chains
    /// cannot deadlock.
    pub async fn lock_all(&self, identities: &[String]) -> Vec<RecordGuard> {
        let mut sorted: Vec<&String> = identities.iter().collect();
        sorted.sort();
        sorted.dedup();

        let mut guards = Vec::with_capacity(sorted.len());
        for identity in sorted {
            guards.push(self.handle(identity).lock_owned().await);
        }
        guards
    }

    /// Lock a record if nobody else holds it
    pub fn try_lock(&self, identity: &str) -> Option<RecordGuard> {
        self.handle(identity).try_lock_owned().ok()
    }

    /// Drop the lock entry of a deleted record
    pub fn forget(&self, identity: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(identity);
    }
}

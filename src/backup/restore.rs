//! Restore with an automatic safety backup
//!
//! ```text
//! resolve chain ─ checksums ─ decode all ─ safety backup ─ detach
//!     └─ replay chain ──ok──► reattach ─ restoration_count += 1
//!             └─ err ─ replay safety ──ok──► ReplayFailure
//!                           └─ err ─ marker file ─► InconsistentState
//! ```

use crate::backup::artifact::{read_artifact, BackupLayout};
use crate::backup::error::{BackupError, Result};
use crate::backup::full::{FullBackupBuilder, FullBackupRequest};
use crate::backup::record::BackupRecord;
use crate::backup::verify::{load_chain, replay_chain, resolve_chain};
use crate::catalog::BackupCatalog;
use crate::store::Datastore;
use chrono::Utc;
use std::fs;
use std::sync::Arc;

/// A completed restore
#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    /// The restored record, with its updated restoration count
    pub restored: BackupRecord,
    /// Safety backup of the state the restore replaced
    pub safety: BackupRecord,
    /// Identities replayed, root first
    pub chain: Vec<String>,
}

pub struct RestoreEngine {
    catalog: Arc<BackupCatalog>,
    store: Arc<dyn Datastore>,
    layout: BackupLayout,
    full: Arc<FullBackupBuilder>,
}

impl RestoreEngine {
    pub fn new(
        catalog: Arc<BackupCatalog>,
        store: Arc<dyn Datastore>,
        layout: BackupLayout,
        full: Arc<FullBackupBuilder>,
    ) -> Self {
        Self {
            catalog,
            store,
            layout,
            full,
        }
    }

    /// Replace the live store with the content of `identity`
    pub fn restore(&self, identity: &str, verify_checksum: bool) -> Result<RestoreOutcome> {
        let chain = resolve_chain(&self.catalog, identity)?;
        let payloads = load_chain(&self.layout, &chain, verify_checksum)?;
        let chain: Vec<String> = chain.into_iter().map(|r| r.identity).collect();

        let safety = self
            .full
            .build(&FullBackupRequest::safety(format!(
                "Automatic safety backup before restoring {}",
                identity
            )))?;
        let safety_script = read_artifact(&safety.path)?.script;
        tracing::info!("Safety backup {} created, replacing live store", safety.record.identity);

        self.store.detach()?;
        let replayed = match replay_chain(self.store.as_ref(), &payloads) {
            Ok(()) => Ok(()),
            Err(replay_err) => {
                tracing::error!("Restore of {} failed: {}", identity, replay_err);
                Err(self.roll_back(identity, &safety.record, &safety_script, &replay_err.to_string()))
            }
        };
        let reattached = self.store.reattach();
        replayed?;
        reattached?;

        let restored = self.catalog.record_restoration(identity)?;
        self.clear_marker();
        tracing::info!("✓ Restored {} (restoration #{})", identity, restored.restoration_count);

        Ok(RestoreOutcome {
            restored,
            safety: safety.record,
            chain,
        })
    }

    /// Put the safety backup back after a failed replay
    fn roll_back(
        &self,
        identity: &str,
        safety: &BackupRecord,
        safety_script: &str,
        replay_err: &str,
    ) -> BackupError {
        match self.store.replace_from(safety_script) {
            Ok(()) => {
                tracing::warn!("Live store rolled back to safety backup {}", safety.identity);
                BackupError::ReplayFailure(format!(
                    "{}; live store rolled back to safety backup {}",
                    replay_err, safety.identity
                ))
            }
            Err(rollback_err) => {
                let message = format!("{}; rollback: {}", replay_err, rollback_err);
                self.write_marker(identity, &safety.identity, &message);
                BackupError::InconsistentState {
                    identity: identity.to_string(),
                    safety: safety.identity.clone(),
                    message,
                }
            }
        }
    }

    fn write_marker(&self, identity: &str, safety: &str, message: &str) {
        let marker = self.layout.inconsistency_marker();
        let contents = format!(
            "time: {}\nrestoring: {}\nsafety backup: {}\nerror: {}\n",
            Utc::now().to_rfc3339(),
            identity,
            safety,
            message
        );
        match fs::write(&marker, contents) {
            Ok(()) => tracing::error!("Live store inconsistent, wrote {}", marker.display()),
            Err(e) => tracing::error!("Live store inconsistent and {} could not be written: {}", marker.display(), e),
        }
    }

    fn clear_marker(&self) {
        let marker = self.layout.inconsistency_marker();
        if marker.exists() {
            match fs::remove_file(&marker) {
                Ok(()) => tracing::info!("Cleared {}", marker.display()),
                Err(e) => tracing::warn!("Failed to clear {}: {}", marker.display(), e),
            }
        }
    }
}

//! Backup engine
//!
//! ```text
//! BackupEngine (async)
//!     ├─ FullBackupBuilder         dump + config + logs ─► artifact
//!     ├─ IncrementalBackupBuilder  rows since anchor     ─► delta artifact
//!     ├─ IntegrityVerifier         size, checksum, scratch replay
//!     ├─ RestoreEngine             safety backup, replace, rollback
//!     └─ RetentionManager          per-class pruning
//! ```
//!
//! Components are synchronous. The engine runs each one on the blocking pool
//! under the configured timeout. The blocking task owns the store gate
//! (shared for backups and verification, exclusive for restores) and the
//! per-record locks until it finishes.

pub mod artifact;
pub mod disk;
pub mod error;
pub mod full;
pub mod incremental;
pub mod locks;
pub mod record;
pub mod restore;
pub mod retention;
pub mod verify;

pub use artifact::BackupLayout;
pub use error::{BackupError, Result};
pub use full::{AdjunctSources, FullBackupBuilder, FullBackupOutcome, FullBackupRequest};
pub use incremental::{IncrementalBackupBuilder, IncrementalOutcome, IncrementalRequest};
pub use locks::RecordLocks;
pub use record::{BackupClass, BackupKind, BackupRecord};
pub use restore::{RestoreEngine, RestoreOutcome};
pub use retention::{CleanupReport, RetentionManager};
pub use verify::{IntegrityVerifier, VerificationReport};

use crate::catalog::BackupCatalog;
use crate::config::Config;
use crate::store::Datastore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// A cataloged backup and where its artifact is
#[derive(Debug, Clone)]
pub struct ListedBackup {
    pub record: BackupRecord,
    /// `None` when no class directory holds the artifact
    pub location: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct BackupListing {
    /// Newest first
    pub backups: Vec<ListedBackup>,
    /// Present when a failed restore left the live store inconsistent
    pub inconsistency_marker: Option<PathBuf>,
}

/// Entry point for every backup operation
pub struct BackupEngine {
    catalog: Arc<BackupCatalog>,
    layout: BackupLayout,
    full: Arc<FullBackupBuilder>,
    incremental: Arc<IncrementalBackupBuilder>,
    verifier: Arc<IntegrityVerifier>,
    restorer: Arc<RestoreEngine>,
    retention: Arc<RetentionManager>,
    locks: Arc<RecordLocks>,
    gate: Arc<RwLock<()>>,
    timeout: Duration,
    min_free_bytes: u64,
    include_logs: bool,
}

impl BackupEngine {
    pub fn new(config: &Config, catalog: Arc<BackupCatalog>, store: Arc<dyn Datastore>) -> Self {
        let layout = BackupLayout::new(&config.backup_dir);
        let locks = Arc::new(RecordLocks::new());

        let full = Arc::new(FullBackupBuilder::new(
            catalog.clone(),
            store.clone(),
            layout.clone(),
            AdjunctSources::from_config(config),
        ));
        let incremental = Arc::new(IncrementalBackupBuilder::new(
            catalog.clone(),
            store.clone(),
            layout.clone(),
            config.tables.clone(),
            full.clone(),
        ));
        let verifier = Arc::new(IntegrityVerifier::new(catalog.clone(), layout.clone()));
        let restorer = Arc::new(RestoreEngine::new(
            catalog.clone(),
            store,
            layout.clone(),
            full.clone(),
        ));
        let retention = Arc::new(RetentionManager::new(
            catalog.clone(),
            layout.clone(),
            config.retention.clone(),
            locks.clone(),
        ));

        Self {
            catalog,
            layout,
            full,
            incremental,
            verifier,
            restorer,
            retention,
            locks,
            gate: Arc::new(RwLock::new(())),
            timeout: config.operation_timeout(),
            min_free_bytes: config.min_free_bytes,
            include_logs: config.include_logs,
        }
    }

    /// Open the catalog and the SQLite store named by `config`
    pub fn open(config: &Config) -> Result<Self> {
        let catalog = Arc::new(BackupCatalog::open(&config.catalog_dir())?);
        let store = Arc::new(crate::store::SqliteStore::open(&config.database_path)?);
        Ok(Self::new(config, catalog, store))
    }

    pub fn catalog(&self) -> &Arc<BackupCatalog> {
        &self.catalog
    }

    pub fn layout(&self) -> &BackupLayout {
        &self.layout
    }

    /// Whether scheduled full backups bundle logs
    pub fn include_logs(&self) -> bool {
        self.include_logs
    }

    pub async fn create_full(&self, request: FullBackupRequest) -> Result<FullBackupOutcome> {
        self.ensure_space().await;
        let gate = self.gate.clone().read_owned().await;
        let full = self.full.clone();
        self.run_blocking("full backup", move || {
            let _gate = gate;
            full.build(&request)
        })
        .await
    }

    pub async fn create_incremental(&self, request: IncrementalRequest) -> Result<IncrementalOutcome> {
        self.ensure_space().await;
        let gate = self.gate.clone().read_owned().await;
        let incremental = self.incremental.clone();
        self.run_blocking("incremental backup", move || {
            let _gate = gate;
            incremental.build(&request)
        })
        .await
    }

    pub async fn verify(&self, identity: &str) -> Result<VerificationReport> {
        let chain = self.chain_identities(identity)?;
        let records = self.locks.lock_all(&chain).await;
        let gate = self.gate.clone().read_owned().await;

        let verifier = self.verifier.clone();
        let identity = identity.to_string();
        self.run_blocking("verification", move || {
            let _held = (records, gate);
            verifier.verify(&identity)
        })
        .await
    }

    pub async fn restore(&self, identity: &str, verify_checksum: bool) -> Result<RestoreOutcome> {
        let chain = self.chain_identities(identity)?;
        let records = self.locks.lock_all(&chain).await;
        let gate = self.gate.clone().write_owned().await;

        let restorer = self.restorer.clone();
        let identity = identity.to_string();
        self.run_blocking("restore", move || {
            let _held = (records, gate);
            restorer.restore(&identity, verify_checksum)
        })
        .await
    }

    pub async fn cleanup(&self) -> Result<CleanupReport> {
        let retention = self.retention.clone();
        self.run_blocking("cleanup", move || retention.cleanup())
            .await
    }

    /// Cataloged backups, optionally of one class, newest first
    pub fn list(&self, class: Option<BackupClass>) -> Result<BackupListing> {
        let mut records = self.catalog.list()?;
        records.reverse();

        let backups = records
            .into_iter()
            .filter(|r| class.is_none_or(|c| r.class == c))
            .map(|record| ListedBackup {
                location: self.layout.locate(&record),
                record,
            })
            .collect();

        let marker = self.layout.inconsistency_marker();
        Ok(BackupListing {
            backups,
            inconsistency_marker: marker.exists().then_some(marker),
        })
    }

    /// Map a backup path or bare identity to a cataloged identity
    pub fn resolve(&self, path_or_identity: &str) -> Result<String> {
        let identity = Path::new(path_or_identity)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(path_or_identity)
            .to_string();

        if self.catalog.contains(&identity)? {
            Ok(identity)
        } else {
            Err(BackupError::UnknownBackup(path_or_identity.to_string()))
        }
    }

    /// Identities a verify or restore of `identity` will read
    ///
    /// A broken chain still locks the record itself; the operation reports the
    /// break.
    fn chain_identities(&self, identity: &str) -> Result<Vec<String>> {
        match verify::resolve_chain(&self.catalog, identity) {
            Ok(chain) => Ok(chain.into_iter().map(|r| r.identity).collect()),
            Err(BackupError::BrokenChain { .. }) => Ok(vec![identity.to_string()]),
            Err(e) => Err(e),
        }
    }

    /// Run retention first when the backup volume is low on space
    async fn ensure_space(&self) {
        let root = self.layout.root().to_path_buf();
        let Ok(Some(available)) = tokio::task::spawn_blocking(move || disk::available_space(&root)).await else {
            return;
        };
        if available >= self.min_free_bytes {
            return;
        }

        tracing::warn!(
            "Only {} MB free on backup volume, running cleanup first",
            available / (1024 * 1024)
        );
        if let Err(e) = self.cleanup().await {
            tracing::error!("Cleanup before backup failed: {}", e);
        }

        let root = self.layout.root().to_path_buf();
        if let Ok(Some(available)) = tokio::task::spawn_blocking(move || disk::available_space(&root)).await {
            if available < self.min_free_bytes {
                tracing::warn!(
                    "Backup volume still low on space ({} MB free), continuing anyway",
                    available / (1024 * 1024)
                );
            }
        }
    }

    /// Run `f` on the blocking pool, bounded by the operation timeout
    ///
    /// A timed-out task keeps running to completion in the background, still
    /// holding whatever guards it was given; its result is discarded.
    async fn run_blocking<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let task = tokio::task::spawn_blocking(f);
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(BackupError::Task(join_err.to_string())),
            Err(_) => {
                tracing::error!("{} timed out after {:?}", operation, self.timeout);
                Err(BackupError::Timeout {
                    operation,
                    after: self.timeout,
                })
            }
        }
    }
}

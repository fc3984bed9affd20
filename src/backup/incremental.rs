//! Incremental backups
//!
//! A delta holds one `INSERT OR REPLACE` per row whose change timestamp is at
//! or after the anchor, the creation time of the latest full or incremental
//! backup. Deleted rows are not tracked.

use crate::backup::artifact::{
    register_artifact, ArtifactManifest, ArtifactWriter, BackupLayout, DELTA_ENTRY,
    MANIFEST_ENTRY,
};
use crate::backup::error::{BackupError, Result};
use crate::backup::full::{FullBackupBuilder, FullBackupOutcome, FullBackupRequest};
use crate::backup::record::{BackupClass, BackupKind, BackupRecord};
use crate::catalog::BackupCatalog;
use crate::store::{Datastore, TableDescriptor};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Parameters of an incremental backup
#[derive(Debug, Clone)]
pub struct IncrementalRequest {
    pub class: BackupClass,
    pub description: Option<String>,
    /// Only used when there is no anchor and a full backup is taken instead
    pub include_logs: bool,
}

impl IncrementalRequest {
    pub fn new(class: BackupClass) -> Self {
        Self {
            class,
            description: None,
            include_logs: false,
        }
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }
}

/// Result of an incremental backup attempt
#[derive(Debug)]
pub enum IncrementalOutcome {
    /// A delta artifact was written and cataloged
    Created {
        record: BackupRecord,
        path: PathBuf,
        row_changes: BTreeMap<String, usize>,
    },
    /// No anchor existed, so a full backup was taken
    FellBackToFull(FullBackupOutcome),
    /// Nothing changed since the anchor; no artifact was written
    NoChanges { anchor: BackupRecord },
}

impl IncrementalOutcome {
    /// The record created by this attempt, if any
    pub fn record(&self) -> Option<&BackupRecord> {
        match self {
            IncrementalOutcome::Created { record, .. } => Some(record),
            IncrementalOutcome::FellBackToFull(outcome) => Some(&outcome.record),
            IncrementalOutcome::NoChanges { .. } => None,
        }
    }
}

/// Builds delta backups over a fixed list of change-tracked tables
pub struct IncrementalBackupBuilder {
    catalog: Arc<BackupCatalog>,
    store: Arc<dyn Datastore>,
    layout: BackupLayout,
    tables: Vec<TableDescriptor>,
    full: Arc<FullBackupBuilder>,
}

impl IncrementalBackupBuilder {
    pub fn new(
        catalog: Arc<BackupCatalog>,
        store: Arc<dyn Datastore>,
        layout: BackupLayout,
        tables: Vec<TableDescriptor>,
        full: Arc<FullBackupBuilder>,
    ) -> Self {
        Self {
            catalog,
            store,
            layout,
            tables,
            full,
        }
    }

    pub fn build(&self, request: &IncrementalRequest) -> Result<IncrementalOutcome> {
        let Some(anchor) = self.catalog.latest_anchor()? else {
            tracing::info!("No previous backup to anchor on, creating a full backup instead");
            let full_request = FullBackupRequest::new(request.class)
                .with_description(request.description.clone())
                .with_logs(request.include_logs);
            return self
                .full
                .build(&full_request)
                .map(IncrementalOutcome::FellBackToFull);
        };

        let created_at = self.catalog.next_timestamp()?;
        let mut row_changes = BTreeMap::new();
        let mut script = String::from("BEGIN TRANSACTION;\n");
        for descriptor in &self.tables {
            let statements = self.store.upserts_since(descriptor, anchor.created_at)?;
            if statements.is_empty() {
                continue;
            }
            tracing::debug!("{}: {} changed rows", descriptor.table, statements.len());
            row_changes.insert(descriptor.table.clone(), statements.len());
            for statement in statements {
                script.push_str(&statement);
                script.push('\n');
            }
        }
        script.push_str("COMMIT;\n");

        if row_changes.is_empty() {
            tracing::info!("No changes since {}, skipping incremental backup", anchor.identity);
            return Ok(IncrementalOutcome::NoChanges { anchor });
        }

        self.layout.ensure_dirs()?;
        let identity = self.layout.allocate_identity(
            &self.catalog,
            request.class,
            BackupKind::Incremental,
            created_at,
        )?;

        let mut manifest = ArtifactManifest::new(BackupKind::Incremental, request.class, created_at);
        manifest.description = request.description.clone();
        manifest.parent = Some(anchor.identity.clone());
        manifest.tables = row_changes.keys().cloned().collect();
        manifest.row_changes = row_changes.clone();

        let mut writer = ArtifactWriter::create(self.layout.artifact_path(request.class, &identity))?;
        writer.append_bytes(DELTA_ENTRY, script.as_bytes())?;
        let manifest_bytes = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| BackupError::artifact_write(&identity, e))?;
        writer.append_bytes(MANIFEST_ENTRY, &manifest_bytes)?;
        let path = writer.finish()?;

        let record = register_artifact(&self.catalog, &path, identity, &manifest)?;
        tracing::info!(
            "Created incremental backup {} on top of {} ({} rows)",
            record.identity,
            anchor.identity,
            row_changes.values().sum::<usize>()
        );

        Ok(IncrementalOutcome::Created {
            record,
            path,
            row_changes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::artifact::read_artifact;
    use crate::backup::full::AdjunctSources;
    use crate::store::SqliteStore;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (Arc<BackupCatalog>, Arc<SqliteStore>, IncrementalBackupBuilder) {
        let root = dir.path();
        let store = Arc::new(SqliteStore::open(root.join("app.db")).unwrap());
        store
            .execute_batch(
                "CREATE TABLE users (user_id INTEGER PRIMARY KEY, name TEXT, updated_at TEXT);
                 INSERT INTO users VALUES (1, 'ada', '2020-01-01 00:00:00');",
            )
            .unwrap();
        let catalog = Arc::new(BackupCatalog::open(&root.join("backups/catalog")).unwrap());
        let layout = BackupLayout::new(root.join("backups"));
        let full = Arc::new(FullBackupBuilder::new(
            catalog.clone(),
            store.clone(),
            layout.clone(),
            AdjunctSources::default(),
        ));
        let builder = IncrementalBackupBuilder::new(
            catalog.clone(),
            store.clone(),
            layout,
            vec![
                TableDescriptor::new("users", "updated_at", &["user_id"]),
                TableDescriptor::new("payments", "updated_at", &["payment_id"]),
            ],
            full,
        );
        (catalog, store, builder)
    }

    #[test]
    fn test_cold_start_falls_back_to_full() {
        let dir = TempDir::new().unwrap();
        let (catalog, _, builder) = setup(&dir);

        let outcome = builder.build(&IncrementalRequest::new(BackupClass::Daily)).unwrap();
        let IncrementalOutcome::FellBackToFull(full) = outcome else {
            panic!("expected a full backup");
        };
        assert_eq!(full.record.kind, BackupKind::Full);
        assert_eq!(full.record.class, BackupClass::Daily);
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn test_no_changes_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let (catalog, _, builder) = setup(&dir);
        builder.build(&IncrementalRequest::new(BackupClass::Daily)).unwrap();

        let outcome = builder.build(&IncrementalRequest::new(BackupClass::Daily)).unwrap();
        assert!(matches!(outcome, IncrementalOutcome::NoChanges { .. }));
        assert!(outcome.record().is_none());
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn test_rows_from_the_anchor_second_are_not_repeated() {
        let dir = TempDir::new().unwrap();
        let (catalog, store, builder) = setup(&dir);
        store
            .execute_batch("INSERT INTO users VALUES (2, 'grace', CURRENT_TIMESTAMP);")
            .unwrap();
        builder.build(&IncrementalRequest::new(BackupClass::Daily)).unwrap();

        for _ in 0..3 {
            let outcome = builder.build(&IncrementalRequest::new(BackupClass::Daily)).unwrap();
            assert!(matches!(outcome, IncrementalOutcome::NoChanges { .. }));
        }
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn test_delta_contains_changed_rows_only() {
        let dir = TempDir::new().unwrap();
        let (catalog, store, builder) = setup(&dir);
        let full = builder.build(&IncrementalRequest::new(BackupClass::Daily)).unwrap();
        let anchor = full.record().unwrap().identity.clone();

        store
            .execute_batch("INSERT INTO users VALUES (2, 'grace', '2099-01-01 00:00:00');")
            .unwrap();
        let outcome = builder.build(&IncrementalRequest::new(BackupClass::Daily)).unwrap();
        let IncrementalOutcome::Created { record, path, row_changes } = outcome else {
            panic!("expected a delta");
        };

        assert_eq!(record.kind, BackupKind::Incremental);
        assert_eq!(record.parent.as_deref(), Some(anchor.as_str()));
        assert_eq!(row_changes.get("users"), Some(&1));
        assert_eq!(catalog.latest_anchor().unwrap().unwrap().identity, record.identity);

        let contents = read_artifact(&path).unwrap();
        assert!(contents.script.contains("'grace'"));
        assert!(!contents.script.contains("'ada'"));
        assert_eq!(contents.manifest.tables, vec!["users".to_string()]);
    }
}

//! Retention enforcement
//!
//! Each class is pruned on its own: records beyond the policy's count or older
//! than its age limit are deleted, artifact first, then catalog entry. With
//! chain protection enabled, a record that a surviving incremental was
//! computed against is kept until its children are gone. Files the catalog
//! does not know about are reported and left alone.

use crate::backup::artifact::BackupLayout;
use crate::backup::error::Result;
use crate::backup::locks::RecordLocks;
use crate::backup::record::{BackupClass, BackupRecord};
use crate::catalog::BackupCatalog;
use crate::config::RetentionConfig;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

/// What a cleanup run did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    /// Identities whose catalog entry was removed
    pub removed: Vec<String>,
    /// Due for deletion but still rooting a surviving chain
    pub protected: Vec<String>,
    /// Due for deletion but locked by a running verify or restore
    pub skipped: Vec<String>,
    /// Artifacts that could not be deleted; their entries were kept
    pub failed: Vec<String>,
    /// Files in class directories with no catalog entry
    pub orphans: Vec<PathBuf>,
    /// Sum of the recorded sizes of deleted artifacts
    pub freed_bytes: u64,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.protected.is_empty() && self.orphans.is_empty()
    }
}

pub struct RetentionManager {
    catalog: Arc<BackupCatalog>,
    layout: BackupLayout,
    config: RetentionConfig,
    locks: Arc<RecordLocks>,
}

impl RetentionManager {
    pub fn new(
        catalog: Arc<BackupCatalog>,
        layout: BackupLayout,
        config: RetentionConfig,
        locks: Arc<RecordLocks>,
    ) -> Self {
        Self {
            catalog,
            layout,
            config,
            locks,
        }
    }

    pub fn cleanup(&self) -> Result<CleanupReport> {
        self.cleanup_at(Utc::now())
    }

    /// Apply retention as of `now`
    pub fn cleanup_at(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        let records = self.catalog.list()?;

        let mut marked: HashSet<String> = BackupClass::ALL
            .into_iter()
            .flat_map(|class| self.due_for_deletion(&records, class, now))
            .collect();

        let mut guards = Vec::new();
        for record in &records {
            if !marked.contains(&record.identity) {
                continue;
            }
            match self.locks.try_lock(&record.identity) {
                Some(guard) => guards.push(guard),
                None => {
                    tracing::info!("Skipping {}: in use", record.identity);
                    marked.remove(&record.identity);
                    report.skipped.push(record.identity.clone());
                }
            }
        }

        if self.config.protect_chain_roots {
            report.protected = protect_chain_roots(&records, &mut marked);
        }

        // Newest first, so a child whose removal fails can still save its parent
        let mut kept_parents: HashSet<String> = HashSet::new();
        for record in records.iter().rev() {
            if !marked.contains(&record.identity) {
                continue;
            }
            if kept_parents.contains(&record.identity) {
                report.protected.push(record.identity.clone());
                continue;
            }

            match self.delete_artifact(record) {
                Ok(freed) => {
                    self.catalog.remove(&record.identity)?;
                    self.locks.forget(&record.identity);
                    report.freed_bytes += freed;
                    report.removed.push(record.identity.clone());
                    tracing::info!("Deleted old backup: {}", record.identity);
                }
                Err(e) => {
                    tracing::warn!("Failed to delete {}: {}", record.identity, e);
                    report.failed.push(record.identity.clone());
                    if self.config.protect_chain_roots {
                        kept_parents.extend(record.parent.clone());
                    }
                }
            }
        }
        drop(guards);

        report.orphans = self.find_orphans()?;
        for orphan in &report.orphans {
            tracing::warn!("Orphaned backup file not in catalog: {}", orphan.display());
        }

        tracing::info!(
            "Cleanup removed {} backups ({} bytes), protected {}, skipped {}, {} orphans",
            report.removed.len(),
            report.freed_bytes,
            report.protected.len(),
            report.skipped.len(),
            report.orphans.len()
        );
        Ok(report)
    }

    /// Identities of one class that exceed its count or age limit
    fn due_for_deletion(
        &self,
        records: &[BackupRecord],
        class: BackupClass,
        now: DateTime<Utc>,
    ) -> Vec<String> {
        let policy = self.config.for_class(class);
        if policy.is_unbounded() {
            return Vec::new();
        }
        let cutoff = policy
            .keep_age_days
            .map(|days| now - Duration::days(i64::from(days)));

        records
            .iter()
            .rev()
            .filter(|r| r.class == class)
            .enumerate()
            .filter(|(position, record)| {
                policy.keep_count.is_some_and(|count| *position >= count)
                    || cutoff.is_some_and(|cutoff| record.created_at < cutoff)
            })
            .map(|(_, record)| record.identity.clone())
            .collect()
    }

    /// Remove a record's artifact, returning the bytes freed
    ///
    /// A record whose file is already gone frees nothing.
    fn delete_artifact(&self, record: &BackupRecord) -> io::Result<u64> {
        let Some(path) = self.layout.locate(record) else {
            tracing::debug!("Artifact of {} already missing", record.identity);
            return Ok(0);
        };
        fs::remove_file(&path)?;
        Ok(record.size_bytes)
    }

    fn find_orphans(&self) -> Result<Vec<PathBuf>> {
        let mut orphans = Vec::new();
        for class in BackupClass::ALL {
            for path in self.layout.list_class_files(class)? {
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if !self.catalog.contains(name)? {
                    orphans.push(path);
                }
            }
        }
        Ok(orphans)
    }
}

/// Unmark every marked record that a surviving record depends on
///
/// Runs to a fixed point: keeping a record can in turn keep its own parent.
fn protect_chain_roots(records: &[BackupRecord], marked: &mut HashSet<String>) -> Vec<String> {
    let mut protected = Vec::new();
    loop {
        let needed: Vec<String> = records
            .iter()
            .filter(|r| !marked.contains(&r.identity))
            .filter_map(|r| r.parent.clone())
            .filter(|parent| marked.contains(parent))
            .collect();
        if needed.is_empty() {
            return protected;
        }
        for parent in needed {
            if marked.remove(&parent) {
                tracing::info!("Keeping {}: a newer incremental depends on it", parent);
                protected.push(parent);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::record::BackupKind;
    use crate::config::RetentionPolicy;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        catalog: Arc<BackupCatalog>,
        layout: BackupLayout,
        locks: Arc<RecordLocks>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let layout = BackupLayout::new(dir.path().join("backups"));
        layout.ensure_dirs().unwrap();
        let catalog = Arc::new(BackupCatalog::open(&dir.path().join("backups/catalog")).unwrap());
        Fixture {
            _dir: dir,
            catalog,
            layout,
            locks: Arc::new(RecordLocks::new()),
        }
    }

    fn add(
        fx: &Fixture,
        identity: &str,
        class: BackupClass,
        kind: BackupKind,
        parent: Option<&str>,
        hours_ago: i64,
    ) {
        let size = 100 + hours_ago as u64;
        fs::write(
            fx.layout.artifact_path(class, identity),
            vec![0u8; size as usize],
        )
        .unwrap();
        fx.catalog
            .insert(&BackupRecord {
                identity: identity.to_string(),
                class,
                kind,
                size_bytes: size,
                checksum: String::new(),
                created_at: Utc::now() - Duration::hours(hours_ago),
                description: None,
                is_compressed: true,
                restoration_count: 0,
                last_verified_at: None,
                parent: parent.map(String::from),
            })
            .unwrap();
    }

    fn manager(fx: &Fixture, config: RetentionConfig) -> RetentionManager {
        RetentionManager::new(fx.catalog.clone(), fx.layout.clone(), config, fx.locks.clone())
    }

    #[test]
    fn test_age_limit() {
        let fx = fixture();
        add(&fx, "old", BackupClass::Daily, BackupKind::Full, None, 24 * 10);
        add(&fx, "new", BackupClass::Daily, BackupKind::Full, None, 1);

        let config = RetentionConfig::uniform(RetentionPolicy::new(None, Some(7)));
        let report = manager(&fx, config).cleanup().unwrap();

        assert_eq!(report.removed, vec!["old".to_string()]);
        assert!(fx.catalog.get("new").unwrap().is_some());
    }

    #[test]
    fn test_chain_root_is_protected() {
        let fx = fixture();
        add(&fx, "root", BackupClass::Weekly, BackupKind::Full, None, 30);
        add(&fx, "newer", BackupClass::Weekly, BackupKind::Full, None, 20);
        add(&fx, "delta", BackupClass::Daily, BackupKind::Incremental, Some("root"), 10);

        let config = RetentionConfig::uniform(RetentionPolicy::default())
            .with_policy(BackupClass::Weekly, RetentionPolicy::keep_count(1));
        let report = manager(&fx, config.clone().with_chain_protection())
            .cleanup()
            .unwrap();
        assert_eq!(report.protected, vec!["root".to_string()]);
        assert!(report.removed.is_empty());

        let report = manager(&fx, config).cleanup().unwrap();
        assert_eq!(report.removed, vec!["root".to_string()]);
    }

    #[test]
    fn test_keep_count_caps_an_incremental_chain() {
        let fx = fixture();
        add(&fx, "full", BackupClass::Daily, BackupKind::Full, None, 50);
        add(&fx, "d1", BackupClass::Daily, BackupKind::Incremental, Some("full"), 40);
        add(&fx, "d2", BackupClass::Daily, BackupKind::Incremental, Some("d1"), 30);
        add(&fx, "d3", BackupClass::Daily, BackupKind::Incremental, Some("d2"), 20);
        add(&fx, "d4", BackupClass::Daily, BackupKind::Incremental, Some("d3"), 10);

        let config = RetentionConfig::uniform(RetentionPolicy::keep_count(2));
        let report = manager(&fx, config.clone()).cleanup().unwrap();

        assert_eq!(
            report.removed,
            vec!["d2".to_string(), "d1".to_string(), "full".to_string()]
        );
        assert!(report.protected.is_empty());
        assert_eq!(report.freed_bytes, 130 + 140 + 150);
        assert_eq!(fs::read_dir(fx.layout.class_dir(BackupClass::Daily)).unwrap().count(), 2);

        // Protection keeps the whole chain behind the surviving deltas
        let fx = fixture();
        add(&fx, "full", BackupClass::Daily, BackupKind::Full, None, 50);
        add(&fx, "d1", BackupClass::Daily, BackupKind::Incremental, Some("full"), 40);
        add(&fx, "d2", BackupClass::Daily, BackupKind::Incremental, Some("d1"), 30);
        let config = RetentionConfig::uniform(RetentionPolicy::keep_count(1));
        let report = manager(&fx, config.with_chain_protection()).cleanup().unwrap();
        assert!(report.removed.is_empty());
        assert_eq!(report.protected.len(), 2);
    }

    #[test]
    fn test_locked_record_is_skipped() {
        let fx = fixture();
        add(&fx, "a", BackupClass::Manual, BackupKind::Full, None, 3);
        add(&fx, "b", BackupClass::Manual, BackupKind::Full, None, 2);

        let guard = fx.locks.try_lock("a").unwrap();
        let config = RetentionConfig::uniform(RetentionPolicy::keep_count(1));
        let report = manager(&fx, config).cleanup().unwrap();
        drop(guard);

        assert_eq!(report.skipped, vec!["a".to_string()]);
        assert!(report.removed.is_empty());
        assert!(fx.catalog.get("a").unwrap().is_some());
    }

    #[test]
    fn test_missing_file_only_drops_entry() {
        let fx = fixture();
        add(&fx, "a", BackupClass::Manual, BackupKind::Full, None, 3);
        add(&fx, "b", BackupClass::Manual, BackupKind::Full, None, 2);
        fs::remove_file(fx.layout.artifact_path(BackupClass::Manual, "a")).unwrap();

        let config = RetentionConfig::uniform(RetentionPolicy::keep_count(1));
        let report = manager(&fx, config).cleanup().unwrap();

        assert_eq!(report.removed, vec!["a".to_string()]);
        assert_eq!(report.freed_bytes, 0);
        assert!(fx.catalog.get("a").unwrap().is_none());
    }
}

//! Backup catalog
//!
//! Durable ledger of every known backup, keyed by artifact identity. Uses the
//! sled embedded database for persistence. Records are only ever appended,
//! updated in place for `restoration_count` / `last_verified_at`, or removed by
//! retention.

use crate::backup::error::{BackupError, Result};
use crate::backup::record::{BackupClass, BackupRecord};
use chrono::{DateTime, Duration, TimeZone, Utc};
use sled::Db;
use std::path::Path;
use std::sync::Mutex;

/// Catalog of backup records
pub struct BackupCatalog {
    db: Db,
    /// Serializes read-modify-write updates
    write_lock: Mutex<()>,
    /// Last creation timestamp handed out by `next_timestamp`
    last_issued: Mutex<Option<DateTime<Utc>>>,
}

impl BackupCatalog {
    /// Open or create a catalog at the given path
    pub fn open(path: &Path) -> Result<Self> {
        // sled only creates the final directory
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = sled::open(path)?;
        let catalog = Self {
            db,
            write_lock: Mutex::new(()),
            last_issued: Mutex::new(None),
        };

        let newest = catalog.list()?.into_iter().map(|r| r.created_at).max();
        *catalog.lock_issued()? = newest;
        tracing::debug!(
            "Opened backup catalog at {} ({} records)",
            path.display(),
            catalog.len()
        );

        Ok(catalog)
    }

    /// Get the record for an identity
    pub fn get(&self, identity: &str) -> Result<Option<BackupRecord>> {
        match self.db.get(identity)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, identity: &str) -> Result<bool> {
        Ok(self.db.contains_key(identity)?)
    }

    /// Append a record; fails if the identity is already cataloged
    pub fn insert(&self, record: &BackupRecord) -> Result<()> {
        let _guard = self.lock_writes()?;
        let bytes = bincode::serialize(record)?;
        if self
            .db
            .compare_and_swap(record.identity.as_bytes(), None::<&[u8]>, Some(bytes))?
            .is_err()
        {
            return Err(BackupError::DuplicateIdentity(record.identity.clone()));
        }
        self.db.flush()?;
        Ok(())
    }

    /// Remove a record, returning it if it existed
    pub fn remove(&self, identity: &str) -> Result<Option<BackupRecord>> {
        let _guard = self.lock_writes()?;
        let removed = match self.db.remove(identity)? {
            Some(bytes) => Some(bincode::deserialize(&bytes)?),
            None => None,
        };
        self.db.flush()?;
        Ok(removed)
    }

    /// All records, oldest first
    pub fn list(&self) -> Result<Vec<BackupRecord>> {
        let mut records = Vec::with_capacity(self.db.len());
        for item in self.db.iter() {
            let (_, bytes) = item?;
            records.push(bincode::deserialize::<BackupRecord>(&bytes)?);
        }
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.identity.cmp(&b.identity))
        });
        Ok(records)
    }

    /// Records of one class, newest first
    pub fn list_by_class(&self, class: BackupClass) -> Result<Vec<BackupRecord>> {
        let mut records: Vec<_> = self
            .list()?
            .into_iter()
            .filter(|r| r.class == class)
            .collect();
        records.reverse();
        Ok(records)
    }

    /// Most recent full or incremental record; anchors the next incremental
    pub fn latest_anchor(&self) -> Result<Option<BackupRecord>> {
        Ok(self.list()?.into_iter().rev().find(|r| r.is_anchor()))
    }

    /// Increment `restoration_count` after a successful restore
    pub fn record_restoration(&self, identity: &str) -> Result<BackupRecord> {
        self.update(identity, |record| record.restoration_count += 1)
    }

    /// Stamp `last_verified_at` after a successful verification
    pub fn mark_verified(&self, identity: &str, at: DateTime<Utc>) -> Result<BackupRecord> {
        self.update(identity, |record| record.last_verified_at = Some(at))
    }

    /// Hand out a creation timestamp strictly after every previous one
    ///
    /// Millisecond precision, matching artifact file names.
    pub fn next_timestamp(&self) -> Result<DateTime<Utc>> {
        let mut last = self.lock_issued()?;
        let now = Utc::now();
        let mut stamp = Utc
            .timestamp_millis_opt(now.timestamp_millis())
            .single()
            .unwrap_or(now);
        if let Some(previous) = *last {
            if stamp <= previous {
                stamp = previous + Duration::milliseconds(1);
            }
        }
        *last = Some(stamp);
        Ok(stamp)
    }

    /// Get total number of cataloged backups
    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    fn update(&self, identity: &str, apply: impl FnOnce(&mut BackupRecord)) -> Result<BackupRecord> {
        let _guard = self.lock_writes()?;
        let mut record = self
            .get(identity)?
            .ok_or_else(|| BackupError::UnknownBackup(identity.to_string()))?;
        apply(&mut record);
        self.db.insert(identity, bincode::serialize(&record)?)?;
        self.db.flush()?;
        Ok(record)
    }

    fn lock_writes(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| BackupError::LockPoisoned("catalog"))
    }

    fn lock_issued(&self) -> Result<std::sync::MutexGuard<'_, Option<DateTime<Utc>>>> {
        self.last_issued
            .lock()
            .map_err(|_| BackupError::LockPoisoned("catalog clock"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::record::BackupKind;
    use tempfile::TempDir;

    fn record(identity: &str, class: BackupClass, kind: BackupKind, minutes_ago: i64) -> BackupRecord {
        BackupRecord {
            identity: identity.to_string(),
            class,
            kind,
            size_bytes: 128,
            checksum: "deadbeef".to_string(),
            created_at: Utc::now() - Duration::minutes(minutes_ago),
            description: None,
            is_compressed: true,
            restoration_count: 0,
            last_verified_at: None,
            parent: None,
        }
    }

    #[test]
    fn test_catalog_new() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let catalog = BackupCatalog::open(&temp_dir.path().join("catalog"))?;
        assert!(catalog.is_empty());
        assert!(catalog.latest_anchor()?.is_none());
        Ok(())
    }

    #[test]
    fn test_insert_get_remove() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let catalog = BackupCatalog::open(&temp_dir.path().join("catalog"))?;

        let entry = record("a.tar.gz", BackupClass::Manual, BackupKind::Full, 5);
        catalog.insert(&entry)?;
        assert_eq!(catalog.get("a.tar.gz")?, Some(entry.clone()));

        assert_eq!(catalog.remove("a.tar.gz")?, Some(entry));
        assert!(catalog.get("a.tar.gz")?.is_none());
        assert!(catalog.remove("a.tar.gz")?.is_none());
        Ok(())
    }

    #[test]
    fn test_duplicate_identity_rejected() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let catalog = BackupCatalog::open(&temp_dir.path().join("catalog"))?;

        let entry = record("a.tar.gz", BackupClass::Manual, BackupKind::Full, 5);
        catalog.insert(&entry)?;
        let err = catalog.insert(&entry).unwrap_err();
        assert!(matches!(err, BackupError::DuplicateIdentity(_)));
        Ok(())
    }

    #[test]
    fn test_queries_by_class_and_anchor() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let catalog = BackupCatalog::open(&temp_dir.path().join("catalog"))?;

        catalog.insert(&record("w1", BackupClass::Weekly, BackupKind::Full, 30))?;
        let mut delta = record("d1", BackupClass::Daily, BackupKind::Incremental, 20);
        delta.parent = Some("w1".to_string());
        catalog.insert(&delta)?;
        catalog.insert(&record("s1", BackupClass::Manual, BackupKind::Safety, 10))?;

        assert_eq!(catalog.latest_anchor()?.unwrap().identity, "d1");
        assert_eq!(catalog.list_by_class(BackupClass::Weekly)?.len(), 1);
        assert_eq!(catalog.list_by_class(BackupClass::Manual)?[0].identity, "s1");
        Ok(())
    }

    #[test]
    fn test_narrow_updates() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let catalog = BackupCatalog::open(&temp_dir.path().join("catalog"))?;
        catalog.insert(&record("a", BackupClass::Manual, BackupKind::Full, 1))?;

        catalog.record_restoration("a")?;
        let updated = catalog.record_restoration("a")?;
        assert_eq!(updated.restoration_count, 2);

        let at = Utc::now();
        let verified = catalog.mark_verified("a", at)?;
        assert_eq!(verified.last_verified_at, Some(at));
        assert_eq!(verified.checksum, "deadbeef");

        assert!(matches!(
            catalog.record_restoration("missing"),
            Err(BackupError::UnknownBackup(_))
        ));
        Ok(())
    }

    #[test]
    fn test_timestamps_strictly_increase() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let catalog = BackupCatalog::open(&temp_dir.path().join("catalog"))?;

        let mut previous = catalog.next_timestamp()?;
        for _ in 0..50 {
            let next = catalog.next_timestamp()?;
            assert!(next > previous);
            previous = next;
        }
        Ok(())
    }

    #[test]
    fn test_catalog_persistence() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("catalog");
        let future = record("future", BackupClass::Manual, BackupKind::Full, -60);

        {
            let catalog = BackupCatalog::open(&path)?;
            catalog.insert(&future)?;
        }

        {
            let catalog = BackupCatalog::open(&path)?;
            assert_eq!(catalog.get("future")?.unwrap().identity, "future");
            // Clock resumes after the newest persisted record
            assert!(catalog.next_timestamp()? > future.created_at);
        }
        Ok(())
    }
}

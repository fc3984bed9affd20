//! Integration tests for the backup scheduler

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use datastore_backup::backup::{BackupClass, BackupEngine, BackupKind};
use datastore_backup::catalog::BackupCatalog;
use datastore_backup::config::Config;
use datastore_backup::scheduler::{BackupScheduler, ScheduledTask};
use datastore_backup::store::{Datastore, SqliteStore, StoreError, TableDescriptor};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn engine(temp_dir: &TempDir) -> Result<Arc<BackupEngine>> {
    let mut config = Config::for_directory(temp_dir.path());
    config.min_free_bytes = 0;

    let store = Arc::new(SqliteStore::open(&config.database_path)?);
    store.execute_batch(
        "CREATE TABLE users (user_id INTEGER PRIMARY KEY, name TEXT, updated_at TEXT);
         INSERT INTO users VALUES (1, 'ada', '2020-01-01 00:00:00');",
    )?;
    let catalog = Arc::new(BackupCatalog::open(&config.catalog_dir())?);
    Ok(Arc::new(BackupEngine::new(&config, catalog, store)))
}

#[tokio::test]
async fn test_run_due_runs_every_task_once() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let engine = engine(&temp_dir)?;
    let scheduler = BackupScheduler::new(engine.clone(), Duration::from_secs(60))?;
    let now = Utc::now();

    assert_eq!(scheduler.due_tasks(now).await, ScheduledTask::ALL.to_vec());
    let runs = scheduler.run_due(now).await;
    assert_eq!(runs.len(), 4);
    for run in &runs {
        assert!(run.outcome.is_ok(), "{} failed: {:?}", run.task.name(), run.outcome);
    }

    // Daily incremental had no anchor and fell back to a full backup
    let daily = engine.catalog().list_by_class(BackupClass::Daily)?;
    assert_eq!(daily.len(), 1);
    assert_eq!(daily[0].kind, BackupKind::Full);
    assert_eq!(engine.catalog().list_by_class(BackupClass::Weekly)?.len(), 1);
    assert_eq!(engine.catalog().list_by_class(BackupClass::Monthly)?.len(), 1);

    assert!(scheduler.due_tasks(now).await.is_empty());
    assert!(scheduler.run_due(now).await.is_empty());
    let next_month = scheduler.due_tasks(now + ChronoDuration::days(32)).await;
    assert_eq!(next_month, ScheduledTask::ALL.to_vec());
    Ok(())
}

#[tokio::test]
async fn test_last_runs_seeded_from_catalog() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let engine = engine(&temp_dir)?;
    let now = Utc::now();

    BackupScheduler::new(engine.clone(), Duration::from_secs(60))?
        .run_due(now)
        .await;

    let restarted = BackupScheduler::new(engine, Duration::from_secs(60))?;
    assert_eq!(
        restarted.due_tasks(now).await,
        vec![ScheduledTask::MonthlyCleanup]
    );
    Ok(())
}

#[tokio::test]
async fn test_run_stops_on_shutdown() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let engine = engine(&temp_dir)?;
    let scheduler = Arc::new(BackupScheduler::new(engine.clone(), Duration::from_millis(50))?);

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let handle = tokio::spawn(scheduler.run(async {
        let _ = stop_rx.await;
    }));

    // First tick fires immediately
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while engine.catalog().len() < 3 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(engine.catalog().len(), 3);

    stop_tx.send(()).ok();
    tokio::time::timeout(Duration::from_secs(30), handle).await??;
    Ok(())
}

/// SQLite store whose first `dump` calls fail
struct FailingDumps {
    inner: SqliteStore,
    failures_left: AtomicUsize,
}

impl Datastore for FailingDumps {
    fn dump(&self) -> Result<String, StoreError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Io(io::Error::other("database file is locked")));
        }
        self.inner.dump()
    }

    fn tables(&self) -> Result<Vec<String>, StoreError> {
        self.inner.tables()
    }

    fn upserts_since(
        &self,
        descriptor: &TableDescriptor,
        anchor: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        self.inner.upserts_since(descriptor, anchor)
    }

    fn replace_from(&self, script: &str) -> Result<(), StoreError> {
        self.inner.replace_from(script)
    }

    fn apply(&self, script: &str) -> Result<(), StoreError> {
        self.inner.apply(script)
    }

    fn detach(&self) -> Result<(), StoreError> {
        self.inner.detach()
    }

    fn reattach(&self) -> Result<(), StoreError> {
        self.inner.reattach()
    }
}

#[tokio::test]
async fn test_failed_task_does_not_stop_the_rest() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let mut config = Config::for_directory(temp_dir.path());
    config.min_free_bytes = 0;

    let inner = SqliteStore::open(&config.database_path)?;
    inner.execute_batch(
        "CREATE TABLE users (user_id INTEGER PRIMARY KEY, name TEXT, updated_at TEXT);
         INSERT INTO users VALUES (1, 'ada', '2020-01-01 00:00:00');",
    )?;
    let store = Arc::new(FailingDumps {
        inner,
        failures_left: AtomicUsize::new(1),
    });
    let catalog = Arc::new(BackupCatalog::open(&config.catalog_dir())?);
    let engine = Arc::new(BackupEngine::new(&config, catalog, store));
    let scheduler = BackupScheduler::new(engine.clone(), Duration::from_secs(60))?;
    let now = Utc::now();

    // The daily task runs first and takes the failing dump
    let runs = scheduler.run_due(now).await;
    assert_eq!(runs.len(), 4);
    assert_eq!(runs[0].task, ScheduledTask::DailyIncremental);
    assert!(runs[0].outcome.is_err());
    for run in &runs[1..] {
        assert!(run.outcome.is_ok(), "{} failed: {:?}", run.task.name(), run.outcome);
    }

    assert!(engine.catalog().list_by_class(BackupClass::Daily)?.is_empty());
    assert_eq!(engine.catalog().list_by_class(BackupClass::Weekly)?.len(), 1);
    assert_eq!(engine.catalog().list_by_class(BackupClass::Monthly)?.len(), 1);

    // Counted as run for today, due again tomorrow
    assert!(scheduler.due_tasks(now).await.is_empty());
    let tomorrow = scheduler.due_tasks(now + ChronoDuration::days(1)).await;
    assert!(tomorrow.contains(&ScheduledTask::DailyIncremental));
    Ok(())
}

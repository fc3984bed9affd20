//! Background backup scheduler
//!
//! Runs in the background and ticks on a fixed interval. Each tick runs every
//! task whose calendar period (day, ISO week, month) has rolled over since its
//! last run:
//! - daily incremental backup (class daily)
//! - weekly full backup (class weekly)
//! - monthly full backup (class monthly)
//! - monthly retention cleanup
//!
//! Last runs of the backup tasks are seeded from the catalog, so a restart
//! does not repeat a backup already taken this period.

use crate::backup::{
    BackupClass, BackupEngine, BackupError, FullBackupRequest, IncrementalOutcome,
    IncrementalRequest,
};
use chrono::{DateTime, Datelike, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;

/// Recurring scheduler jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduledTask {
    DailyIncremental,
    WeeklyFull,
    MonthlyFull,
    MonthlyCleanup,
}

#[derive(Debug, Clone, Copy)]
enum Cadence {
    Daily,
    Weekly,
    Monthly,
}

impl Cadence {
    fn period(&self, at: DateTime<Utc>) -> (i32, u32) {
        match self {
            Cadence::Daily => (at.year(), at.ordinal()),
            Cadence::Weekly => {
                let week = at.iso_week();
                (week.year(), week.week())
            }
            Cadence::Monthly => (at.year(), at.month()),
        }
    }

    fn is_due(&self, last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        last.is_none_or(|last| self.period(last) < self.period(now))
    }
}

impl ScheduledTask {
    pub const ALL: [ScheduledTask; 4] = [
        ScheduledTask::DailyIncremental,
        ScheduledTask::WeeklyFull,
        ScheduledTask::MonthlyFull,
        ScheduledTask::MonthlyCleanup,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ScheduledTask::DailyIncremental => "daily incremental backup",
            ScheduledTask::WeeklyFull => "weekly full backup",
            ScheduledTask::MonthlyFull => "monthly full backup",
            ScheduledTask::MonthlyCleanup => "monthly cleanup",
        }
    }

    fn cadence(&self) -> Cadence {
        match self {
            ScheduledTask::DailyIncremental => Cadence::Daily,
            ScheduledTask::WeeklyFull => Cadence::Weekly,
            ScheduledTask::MonthlyFull | ScheduledTask::MonthlyCleanup => Cadence::Monthly,
        }
    }

    /// Class whose newest record counts as this task's last run
    fn class(&self) -> Option<BackupClass> {
        match self {
            ScheduledTask::DailyIncremental => Some(BackupClass::Daily),
            ScheduledTask::WeeklyFull => Some(BackupClass::Weekly),
            ScheduledTask::MonthlyFull => Some(BackupClass::Monthly),
            ScheduledTask::MonthlyCleanup => None,
        }
    }
}

/// Result of one task run
#[derive(Debug)]
pub struct TaskRun {
    pub task: ScheduledTask,
    pub outcome: Result<String, BackupError>,
}

/// Drives scheduled backups through a shared engine
pub struct BackupScheduler {
    engine: Arc<BackupEngine>,
    interval: Duration,
    last_runs: Mutex<HashMap<ScheduledTask, DateTime<Utc>>>,
}

impl BackupScheduler {
    /// Create a scheduler, seeding last runs from the catalog
    pub fn new(engine: Arc<BackupEngine>, interval: Duration) -> Result<Self, BackupError> {
        let mut last_runs = HashMap::new();
        for task in ScheduledTask::ALL {
            let Some(class) = task.class() else {
                continue;
            };
            if let Some(newest) = engine.catalog().list_by_class(class)?.first() {
                last_runs.insert(task, newest.created_at);
            }
        }

        Ok(Self {
            engine,
            interval,
            last_runs: Mutex::new(last_runs),
        })
    }

    /// Tasks whose period has rolled over as of `now`
    pub async fn due_tasks(&self, now: DateTime<Utc>) -> Vec<ScheduledTask> {
        let last_runs = self.last_runs.lock().await;
        ScheduledTask::ALL
            .into_iter()
            .filter(|task| task.cadence().is_due(last_runs.get(task).copied(), now))
            .collect()
    }

    /// Run every due task
    ///
    /// A failed task is logged and counts as run for its period; the remaining
    /// tasks still run.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Vec<TaskRun> {
        let mut runs = Vec::new();
        for task in self.due_tasks(now).await {
            tracing::info!("Running scheduled {}", task.name());
            let outcome = self.run_task(task).await;
            match &outcome {
                Ok(summary) => tracing::info!("✓ {}: {}", task.name(), summary),
                Err(e) => tracing::error!("✗ {} failed: {}", task.name(), e),
            }
            self.last_runs.lock().await.insert(task, now);
            runs.push(TaskRun { task, outcome });
        }
        runs
    }

    /// Run one task immediately, regardless of its schedule
    pub async fn run_task(&self, task: ScheduledTask) -> Result<String, BackupError> {
        let include_logs = self.engine.include_logs();
        match task {
            ScheduledTask::DailyIncremental => {
                let request = IncrementalRequest {
                    class: BackupClass::Daily,
                    description: Some("Scheduled daily backup".to_string()),
                    include_logs,
                };
                Ok(match self.engine.create_incremental(request).await? {
                    IncrementalOutcome::Created { record, .. } => format!("created {}", record.identity),
                    IncrementalOutcome::FellBackToFull(full) => {
                        format!("no anchor, created full backup {}", full.record.identity)
                    }
                    IncrementalOutcome::NoChanges { anchor } => {
                        format!("no changes since {}", anchor.identity)
                    }
                })
            }
            ScheduledTask::WeeklyFull | ScheduledTask::MonthlyFull => {
                let (class, label) = if task == ScheduledTask::WeeklyFull {
                    (BackupClass::Weekly, "Scheduled weekly backup")
                } else {
                    (BackupClass::Monthly, "Scheduled monthly backup")
                };
                let request = FullBackupRequest::new(class)
                    .with_description(Some(label.to_string()))
                    .with_logs(include_logs);
                let outcome = self.engine.create_full(request).await?;
                Ok(format!(
                    "created {} ({} warnings)",
                    outcome.record.identity,
                    outcome.warnings.len()
                ))
            }
            ScheduledTask::MonthlyCleanup => {
                let report = self.engine.cleanup().await?;
                Ok(format!(
                    "removed {} backups, freed {} bytes",
                    report.removed.len(),
                    report.freed_bytes
                ))
            }
        }
    }

    /// Tick until `shutdown` resolves
    ///
    /// # Example
    /// ```no_run
    /// # use datastore_backup::{backup::BackupEngine, config::Config, scheduler::BackupScheduler};
    /// # use std::sync::Arc;
    /// # async fn example() -> anyhow::Result<()> {
    /// let config = Config::from_env();
    /// let engine = Arc::new(BackupEngine::open(&config)?);
    /// let scheduler = Arc::new(BackupScheduler::new(engine, config.schedule_interval())?);
    /// scheduler.run(async { let _ = tokio::signal::ctrl_c().await; }).await;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn run(self: Arc<Self>, shutdown: impl Future<Output = ()>) {
        tracing::info!(
            "Starting backup scheduler with {}s interval",
            self.interval.as_secs()
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Backup scheduler stopped");
                    break;
                }
                _ = interval.tick() => {
                    self.run_due(Utc::now()).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_cadence_periods() {
        let monday = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        let sunday = Utc.with_ymd_and_hms(2024, 1, 7, 23, 0, 0).unwrap();
        let next_monday = Utc.with_ymd_and_hms(2024, 1, 8, 0, 30, 0).unwrap();

        assert!(Cadence::Daily.is_due(None, monday));
        assert!(!Cadence::Daily.is_due(Some(monday), monday));
        assert!(Cadence::Daily.is_due(Some(monday), sunday));
        assert!(!Cadence::Weekly.is_due(Some(monday), sunday));
        assert!(Cadence::Weekly.is_due(Some(sunday), next_monday));
        assert!(!Cadence::Monthly.is_due(Some(monday), next_monday));
    }

    #[test]
    fn test_weekly_across_year_boundary() {
        let dec_31 = Utc.with_ymd_and_hms(2024, 12, 31, 12, 0, 0).unwrap();
        let jan_1 = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        // Both days fall in ISO week 1 of 2025
        assert!(!Cadence::Weekly.is_due(Some(dec_31), jan_1));
        assert!(Cadence::Monthly.is_due(Some(dec_31), jan_1));
    }
}

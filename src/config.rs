//! Configuration management with config file and environment variable support
//!
//! Defaults are overridden by an optional TOML file, then by environment
//! variables.

pub mod errors;
pub mod retention;

pub use errors::{Error, ErrorContextExt, ErrorMessage, Result};
pub use retention::{RetentionConfig, RetentionPolicy};

use crate::store::TableDescriptor;
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Backup engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Live SQLite database
    pub database_path: PathBuf,
    /// Root of the class-partitioned backup directories and the catalog
    pub backup_dir: PathBuf,
    /// Glob patterns of configuration files bundled into full backups
    pub config_files: Vec<String>,
    /// Directory of application logs bundled into full backups
    pub log_dir: Option<PathBuf>,
    /// Only logs modified within this many days are bundled
    pub log_window_days: i64,
    /// Bundle logs into scheduled full backups
    pub include_logs: bool,
    pub retention: RetentionConfig,
    /// Tables scanned for incremental backups
    pub tables: Vec<TableDescriptor>,
    /// Upper bound for any single engine operation, in seconds
    pub operation_timeout_secs: u64,
    /// Scheduler tick, in seconds
    pub schedule_interval_secs: u64,
    /// Run retention before a backup when the backup volume has less free space
    pub min_free_bytes: u64,
    /// Enable debug logging
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            database_path: data_dir.join("app.db"),
            backup_dir: data_dir.join("backups"),
            config_files: Vec::new(),
            log_dir: None,
            log_window_days: 7,
            include_logs: false,
            retention: RetentionConfig::default(),
            tables: default_tables(),
            operation_timeout_secs: 3600,
            schedule_interval_secs: 60,
            min_free_bytes: 512 * 1024 * 1024, // 512 MB
            debug: false,
        }
    }
}

/// On-disk shape of the config file; every key is optional
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    database_path: Option<PathBuf>,
    backup_dir: Option<PathBuf>,
    config_files: Option<Vec<String>>,
    log_dir: Option<PathBuf>,
    log_window_days: Option<i64>,
    include_logs: Option<bool>,
    operation_timeout_secs: Option<u64>,
    schedule_interval_secs: Option<u64>,
    min_free_mb: Option<u64>,
    retention: Option<RetentionConfig>,
    tables: Option<Vec<TableDescriptor>>,
}

impl Config {
    /// Load defaults, then `path` (if given), then environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = path {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let file: FileConfig = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            config.apply_file(file);
        }

        config.apply_env();
        Ok(config)
    }

    /// Load configuration from environment variables
    ///
    /// Supported environment variables:
    /// - BACKUP_DATABASE_PATH: Live database file
    /// - BACKUP_DIR: Backup root directory
    /// - BACKUP_CONFIG_FILES: Comma separated glob patterns of config files
    /// - BACKUP_LOG_DIR: Log directory
    /// - BACKUP_INCLUDE_LOGS: Bundle logs into scheduled backups (default: false)
    /// - BACKUP_TIMEOUT_SECS: Operation timeout (default: 3600)
    /// - BACKUP_SCHEDULE_INTERVAL_SECS: Scheduler tick (default: 60)
    /// - BACKUP_MIN_FREE_MB: Free space threshold in MB (default: 512)
    /// - DEBUG: Enable debug logging (default: false)
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(path) = file.database_path {
            self.database_path = path;
        }
        if let Some(dir) = file.backup_dir {
            self.backup_dir = dir;
        }
        if let Some(patterns) = file.config_files {
            self.config_files = patterns;
        }
        if file.log_dir.is_some() {
            self.log_dir = file.log_dir;
        }
        if let Some(days) = file.log_window_days {
            self.log_window_days = days;
        }
        if let Some(include) = file.include_logs {
            self.include_logs = include;
        }
        if let Some(secs) = file.operation_timeout_secs {
            self.operation_timeout_secs = secs;
        }
        if let Some(secs) = file.schedule_interval_secs {
            self.schedule_interval_secs = secs;
        }
        if let Some(mb) = file.min_free_mb {
            self.min_free_bytes = mb * 1024 * 1024;
        }
        if let Some(retention) = file.retention {
            self.retention = retention;
        }
        if let Some(tables) = file.tables {
            self.tables = tables;
        }
    }

    fn apply_env(&mut self) {
        if let Ok(path) = env::var("BACKUP_DATABASE_PATH") {
            self.database_path = PathBuf::from(path);
        }

        if let Ok(dir) = env::var("BACKUP_DIR") {
            self.backup_dir = PathBuf::from(dir);
        }

        if let Ok(patterns) = env::var("BACKUP_CONFIG_FILES") {
            self.config_files = patterns
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }

        if let Ok(dir) = env::var("BACKUP_LOG_DIR") {
            self.log_dir = Some(PathBuf::from(dir));
        }

        if let Ok(include) = env::var("BACKUP_INCLUDE_LOGS") {
            self.include_logs = parse_flag(&include);
        }

        if let Ok(secs) = env::var("BACKUP_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse::<u64>() {
                self.operation_timeout_secs = secs;
            }
        }

        if let Ok(secs) = env::var("BACKUP_SCHEDULE_INTERVAL_SECS") {
            if let Ok(secs) = secs.parse::<u64>() {
                self.schedule_interval_secs = secs;
            }
        }

        if let Ok(mb) = env::var("BACKUP_MIN_FREE_MB") {
            if let Ok(mb) = mb.parse::<u64>() {
                self.min_free_bytes = mb * 1024 * 1024;
            }
        }

        if let Ok(debug) = env::var("DEBUG") {
            self.debug = parse_flag(&debug);
        }
    }

    /// Configuration rooted in `dir`, for tests and tooling
    pub fn for_directory(dir: &Path) -> Self {
        Self {
            database_path: dir.join("app.db"),
            backup_dir: dir.join("backups"),
            ..Self::default()
        }
    }

    /// Get the catalog directory
    pub fn catalog_dir(&self) -> PathBuf {
        self.backup_dir.join("catalog")
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_secs(self.schedule_interval_secs.max(1))
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        println!("\n=== Configuration ===");
        println!("Database:        {}", self.database_path.display());
        println!("Backup Dir:      {}", self.backup_dir.display());
        println!("Config Files:    {}", if self.config_files.is_empty() { "none".to_string() } else { self.config_files.join(", ") });
        println!("Log Dir:         {}", self.log_dir.as_ref().map(|d| d.display().to_string()).unwrap_or_else(|| "none".to_string()));
        println!("Tables:          {}", self.tables.len());
        println!("Timeout:         {}s", self.operation_timeout_secs);
        println!("Min Free Space:  {} MB", self.min_free_bytes / (1024 * 1024));
        println!("Debug:           {}", self.debug);
        println!("====================\n");
    }
}

fn parse_flag(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}

/// Change-tracked tables of the host application's schema
fn default_tables() -> Vec<TableDescriptor> {
    vec![
        TableDescriptor::new("users", "updated_at", &["user_id"]),
        TableDescriptor::new("payments", "updated_at", &["payment_id"]),
        TableDescriptor::new("referrals", "created_at", &["referral_id"]),
        TableDescriptor::new("admins", "updated_at", &["user_id"]),
    ]
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    if let Some(dirs) = directories::ProjectDirs::from("dev", "datastore-backup", "datastore-backup") {
        dirs.data_dir().to_path_buf()
    } else {
        // Fallback to current directory
        PathBuf::from("./data")
    }
}

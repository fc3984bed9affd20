//! Backup record types
//!
//! A `BackupRecord` is the catalog's view of one artifact on disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Retention and scheduling bucket of a backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupClass {
    Daily,
    Weekly,
    Monthly,
    Manual,
}

impl BackupClass {
    /// All classes, in directory scan order
    pub const ALL: [BackupClass; 4] = [
        BackupClass::Daily,
        BackupClass::Weekly,
        BackupClass::Monthly,
        BackupClass::Manual,
    ];

    /// Directory name under the backup root
    pub fn dir_name(&self) -> &'static str {
        match self {
            BackupClass::Daily => "daily",
            BackupClass::Weekly => "weekly",
            BackupClass::Monthly => "monthly",
            BackupClass::Manual => "manual",
        }
    }
}

impl fmt::Display for BackupClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[derive(Debug, Error)]
#[error("Unknown backup type '{0}' (expected daily, weekly, monthly or manual)")]
pub struct ParseClassError(String);

impl FromStr for BackupClass {
    type Err = ParseClassError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(BackupClass::Daily),
            "weekly" => Ok(BackupClass::Weekly),
            "monthly" => Ok(BackupClass::Monthly),
            "manual" => Ok(BackupClass::Manual),
            _ => Err(ParseClassError(s.to_string())),
        }
    }
}

/// What an artifact contains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    /// Complete dump of the store
    Full,
    /// Upserts for rows changed since the parent backup
    Incremental,
    /// Full dump taken automatically right before a restore
    Safety,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Incremental => "incremental",
            BackupKind::Safety => "safety",
        }
    }

    /// Whether the artifact can be replayed without any other artifact
    pub fn is_self_contained(&self) -> bool {
        !matches!(self, BackupKind::Incremental)
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catalog entry for one backup artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Artifact file name, unique within the catalog
    pub identity: String,
    pub class: BackupClass,
    pub kind: BackupKind,
    /// Artifact size in bytes at creation time
    pub size_bytes: u64,
    /// SHA-256 of the artifact, computed once at creation
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub description: Option<String>,
    pub is_compressed: bool,
    pub restoration_count: u64,
    pub last_verified_at: Option<DateTime<Utc>>,
    /// Anchor backup an incremental delta was computed against
    pub parent: Option<String>,
}

impl BackupRecord {
    /// Whether this record can anchor the next incremental backup
    pub fn is_anchor(&self) -> bool {
        matches!(self.kind, BackupKind::Full | BackupKind::Incremental)
    }
}

//! Per-class retention policies
//!
//! ```text
//! RetentionConfig
//!     ├─ daily    keep 7,  max 7 days
//!     ├─ weekly   keep 4,  max 35 days
//!     ├─ monthly  keep 12, max 365 days
//!     └─ manual   keep 10, no age limit
//! ```
//!
//! A policy with neither limit set keeps everything.

use crate::backup::record::BackupClass;
use serde::{Deserialize, Serialize};

/// Count/age thresholds for one class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Keep at most this many backups
    pub keep_count: Option<usize>,
    /// Delete backups older than this many days
    pub keep_age_days: Option<u32>,
}

impl RetentionPolicy {
    pub fn new(keep_count: Option<usize>, keep_age_days: Option<u32>) -> Self {
        Self {
            keep_count,
            keep_age_days,
        }
    }

    pub fn keep_count(count: usize) -> Self {
        Self::new(Some(count), None)
    }

    /// Whether this policy never deletes anything
    pub fn is_unbounded(&self) -> bool {
        self.keep_count.is_none() && self.keep_age_days.is_none()
    }
}

/// Retention settings for every class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub daily: RetentionPolicy,
    pub weekly: RetentionPolicy,
    pub monthly: RetentionPolicy,
    pub manual: RetentionPolicy,
    /// Keep backups that a surviving incremental still depends on
    ///
    /// Off by default: `keep_count` is then a hard cap per class, and a
    /// pruned chain leaves its surviving deltas unrestorable.
    pub protect_chain_roots: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            daily: RetentionPolicy::new(Some(7), Some(7)),
            weekly: RetentionPolicy::new(Some(4), Some(35)),
            monthly: RetentionPolicy::new(Some(12), Some(365)),
            manual: RetentionPolicy::new(Some(10), None),
            protect_chain_roots: false,
        }
    }
}

impl RetentionConfig {
    /// Same policy for every class
    pub fn uniform(policy: RetentionPolicy) -> Self {
        Self {
            daily: policy,
            weekly: policy,
            monthly: policy,
            manual: policy,
            protect_chain_roots: false,
        }
    }

    /// Keep every record a surviving incremental depends on
    pub fn with_chain_protection(mut self) -> Self {
        self.protect_chain_roots = true;
        self
    }

    pub fn for_class(&self, class: BackupClass) -> RetentionPolicy {
        match class {
            BackupClass::Daily => self.daily,
            BackupClass::Weekly => self.weekly,
            BackupClass::Monthly => self.monthly,
            BackupClass::Manual => self.manual,
        }
    }

    pub fn with_policy(mut self, class: BackupClass, policy: RetentionPolicy) -> Self {
        match class {
            BackupClass::Daily => self.daily = policy,
            BackupClass::Weekly => self.weekly = policy,
            BackupClass::Monthly => self.monthly = policy,
            BackupClass::Manual => self.manual = policy,
        }
        self
    }
}

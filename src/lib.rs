//! Datastore Backup - full and incremental backups of a SQLite datastore
//!
//! Library modules for the `backupctl` binary

pub mod backup;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod scheduler;
pub mod store;

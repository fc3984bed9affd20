//! Integrity verification
//!
//! Checks that an artifact still matches its catalog entry and that it
//! replays into a working store. Replays happen in a scratch store; the live
//! store is never touched.

use crate::backup::artifact::{compute_checksum, read_artifact, ArtifactContents, BackupLayout};
use crate::backup::error::{BackupError, Result};
use crate::backup::record::{BackupKind, BackupRecord};
use crate::catalog::BackupCatalog;
use crate::store::{Datastore, ScratchStore, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::sync::Arc;

/// Outcome of verifying one backup
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationReport {
    pub identity: String,
    pub valid: bool,
    pub size_check: bool,
    pub checksum_check: bool,
    pub restoration_test: bool,
    pub tables_restored: usize,
    pub errors: Vec<String>,
    /// Set when the report was valid and the catalog was stamped
    pub verified_at: Option<DateTime<Utc>>,
}

impl VerificationReport {
    fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            valid: false,
            size_check: false,
            checksum_check: false,
            restoration_test: false,
            tables_restored: 0,
            errors: Vec::new(),
            verified_at: None,
        }
    }
}

pub struct IntegrityVerifier {
    catalog: Arc<BackupCatalog>,
    layout: BackupLayout,
}

impl IntegrityVerifier {
    pub fn new(catalog: Arc<BackupCatalog>, layout: BackupLayout) -> Self {
        Self { catalog, layout }
    }

    /// Run every check and report each one
    ///
    /// Only a missing catalog entry or artifact is an error; failed checks
    /// produce an invalid report.
    pub fn verify(&self, identity: &str) -> Result<VerificationReport> {
        let record = self
            .catalog
            .get(identity)?
            .ok_or_else(|| BackupError::UnknownBackup(identity.to_string()))?;
        let path = self
            .layout
            .locate(&record)
            .ok_or_else(|| BackupError::ArtifactNotFound(identity.to_string()))?;

        let mut report = VerificationReport::new(identity);

        let actual_size = fs::metadata(&path)?.len();
        report.size_check = actual_size == record.size_bytes;
        if !report.size_check {
            report.errors.push(format!(
                "Size mismatch: expected {} bytes, found {} bytes",
                record.size_bytes, actual_size
            ));
        }

        let actual_checksum = compute_checksum(&path)?;
        report.checksum_check = actual_checksum == record.checksum;
        if !report.checksum_check {
            report.errors.push(
                BackupError::ChecksumMismatch {
                    identity: identity.to_string(),
                    expected: record.checksum.clone(),
                    actual: actual_checksum,
                }
                .to_string(),
            );
        }

        match self.restoration_test(&record) {
            Ok(tables) => {
                report.tables_restored = tables;
                report.restoration_test = tables > 0;
                if tables == 0 {
                    report
                        .errors
                        .push("Restoration test produced no tables".to_string());
                }
            }
            Err(e) => report.errors.push(format!("Restoration test failed: {}", e)),
        }

        report.valid = report.size_check && report.checksum_check && report.restoration_test;
        if report.valid {
            let at = Utc::now();
            self.catalog.mark_verified(identity, at)?;
            report.verified_at = Some(at);
            tracing::info!("✓ Backup {} verified ({} tables)", identity, report.tables_restored);
        } else {
            tracing::warn!("✗ Backup {} failed verification: {}", identity, report.errors.join("; "));
        }

        Ok(report)
    }

    /// Replay the record's chain into a scratch store and count its tables
    fn restoration_test(&self, record: &BackupRecord) -> Result<usize> {
        let chain = resolve_chain(&self.catalog, &record.identity)?;
        let payloads = load_chain(&self.layout, &chain, false)?;
        let scratch = ScratchStore::create()?;
        replay_chain(scratch.store(), &payloads)?;
        Ok(scratch.structure_count()?)
    }
}

/// Records needed to rebuild `identity`, root first
///
/// A full or safety record is its own chain. An incremental record is preceded
/// by its parents up to the self-contained backup they are rooted in.
pub fn resolve_chain(catalog: &BackupCatalog, identity: &str) -> Result<Vec<BackupRecord>> {
    let broken = |message: String| BackupError::BrokenChain {
        identity: identity.to_string(),
        message,
    };

    let mut current = catalog
        .get(identity)?
        .ok_or_else(|| BackupError::UnknownBackup(identity.to_string()))?;
    let mut seen = HashSet::new();
    let mut chain = Vec::new();

    loop {
        if !seen.insert(current.identity.clone()) {
            return Err(broken(format!("cycle at {}", current.identity)));
        }
        if current.kind.is_self_contained() {
            chain.push(current);
            break;
        }
        let Some(parent) = current.parent.clone() else {
            return Err(broken(format!("{} has no parent", current.identity)));
        };
        chain.push(current);
        current = catalog
            .get(&parent)?
            .ok_or_else(|| broken(format!("parent {} is no longer cataloged", parent)))?;
    }

    chain.reverse();
    Ok(chain)
}

/// Locate and decode every artifact of a chain, optionally checking checksums
pub fn load_chain(
    layout: &BackupLayout,
    chain: &[BackupRecord],
    verify_checksums: bool,
) -> Result<Vec<ArtifactContents>> {
    let mut payloads = Vec::with_capacity(chain.len());

    for (position, record) in chain.iter().enumerate() {
        let path = layout
            .locate(record)
            .ok_or_else(|| BackupError::ArtifactNotFound(record.identity.clone()))?;

        if verify_checksums {
            let actual = compute_checksum(&path)?;
            if actual != record.checksum {
                return Err(BackupError::ChecksumMismatch {
                    identity: record.identity.clone(),
                    expected: record.checksum.clone(),
                    actual,
                });
            }
        }

        let contents = read_artifact(&path)?;
        let expected_incremental = position > 0;
        if (contents.manifest.kind == BackupKind::Incremental) != expected_incremental {
            return Err(BackupError::invalid_artifact(
                &path,
                format!("unexpected {} artifact at chain position {}", contents.manifest.kind, position),
            ));
        }
        payloads.push(contents);
    }

    Ok(payloads)
}

/// Replace the store with the chain root, then apply each delta in order
pub fn replay_chain(
    store: &dyn Datastore,
    payloads: &[ArtifactContents],
) -> std::result::Result<(), StoreError> {
    let Some((root, deltas)) = payloads.split_first() else {
        return Ok(());
    };
    store.replace_from(&root.script)?;
    for delta in deltas {
        store.apply(&delta.script)?;
    }
    Ok(())
}

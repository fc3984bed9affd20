//! Full and safety backups
//!
//! A full backup is the complete SQL dump of the store plus, best effort,
//! configuration files and recent logs. Failing to capture an adjunct file is a
//! warning; failing to dump the store or write the archive aborts the backup
//! without leaving an artifact or a catalog entry.

use crate::backup::artifact::{
    register_artifact, ArtifactManifest, ArtifactWriter, BackupLayout, DATABASE_ENTRY,
    MANIFEST_ENTRY,
};
use crate::backup::error::{BackupError, Result};
use crate::backup::record::{BackupClass, BackupKind, BackupRecord};
use crate::catalog::BackupCatalog;
use crate::config::Config;
use crate::store::Datastore;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use walkdir::WalkDir;

const CONFIG_SECTION: &str = "config";
const LOGS_SECTION: &str = "logs";

/// What to back up
#[derive(Debug, Clone)]
pub struct FullBackupRequest {
    pub class: BackupClass,
    pub kind: BackupKind,
    pub description: Option<String>,
    pub include_config: bool,
    pub include_logs: bool,
}

impl Default for FullBackupRequest {
    fn default() -> Self {
        Self {
            class: BackupClass::Manual,
            kind: BackupKind::Full,
            description: None,
            include_config: true,
            include_logs: false,
        }
    }
}

impl FullBackupRequest {
    pub fn new(class: BackupClass) -> Self {
        Self {
            class,
            ..Self::default()
        }
    }

    /// Pre-restore safety net; always manual, never bundles logs
    pub fn safety(description: impl Into<String>) -> Self {
        Self {
            class: BackupClass::Manual,
            kind: BackupKind::Safety,
            description: Some(description.into()),
            include_config: true,
            include_logs: false,
        }
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    pub fn with_logs(mut self, include_logs: bool) -> Self {
        self.include_logs = include_logs;
        self
    }
}

/// A cataloged full backup and the adjunct failures it tolerated
#[derive(Debug)]
pub struct FullBackupOutcome {
    pub record: BackupRecord,
    pub path: PathBuf,
    pub warnings: Vec<BackupError>,
}

/// Read-only adjunct inputs bundled into full backups
#[derive(Debug, Clone, Default)]
pub struct AdjunctSources {
    /// Glob patterns of configuration files
    pub config_patterns: Vec<String>,
    pub log_dir: Option<PathBuf>,
    /// Logs last modified longer ago than this are left out
    pub log_window: Duration,
}

impl AdjunctSources {
    pub fn from_config(config: &Config) -> Self {
        Self {
            config_patterns: config.config_files.clone(),
            log_dir: config.log_dir.clone(),
            log_window: Duration::from_secs(config.log_window_days.max(0) as u64 * 24 * 60 * 60),
        }
    }

    /// Append every readable config file; returns how many made it in
    fn append_config(
        &self,
        writer: &mut ArtifactWriter,
        warnings: &mut Vec<BackupError>,
    ) -> Result<usize> {
        let mut files = BTreeSet::new();
        for pattern in &self.config_patterns {
            match glob::glob(pattern) {
                Ok(paths) => {
                    for entry in paths {
                        match entry {
                            Ok(path) if path.is_file() => {
                                files.insert(path);
                            }
                            Ok(_) => {}
                            Err(e) => warnings.push(BackupError::partial_section(CONFIG_SECTION, e)),
                        }
                    }
                }
                Err(e) => warnings.push(BackupError::partial_section(
                    CONFIG_SECTION,
                    format!("invalid pattern '{}': {}", pattern, e),
                )),
            }
        }

        let mut names = BTreeSet::new();
        let mut added = 0;
        for path in files {
            let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            if !names.insert(file_name.clone()) {
                warnings.push(BackupError::partial_section(
                    CONFIG_SECTION,
                    format!("{}: another file named {} is already included", path.display(), file_name),
                ));
                continue;
            }
            let name = format!("{CONFIG_SECTION}/{file_name}");
            if append_tolerant(writer, &name, &path, CONFIG_SECTION, warnings)? {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Append logs modified within the window; returns how many made it in
    fn append_logs(
        &self,
        writer: &mut ArtifactWriter,
        warnings: &mut Vec<BackupError>,
    ) -> Result<usize> {
        let Some(log_dir) = &self.log_dir else {
            return Ok(0);
        };
        if !log_dir.is_dir() {
            warnings.push(BackupError::partial_section(
                LOGS_SECTION,
                format!("{} is not a directory", log_dir.display()),
            ));
            return Ok(0);
        }

        let cutoff = SystemTime::now()
            .checked_sub(self.log_window)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut added = 0;

        for entry in WalkDir::new(log_dir).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warnings.push(BackupError::partial_section(LOGS_SECTION, e));
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let modified = entry.metadata().ok().and_then(|m| m.modified().ok());
            if modified.is_none_or(|m| m < cutoff) {
                continue;
            }

            let relative = entry.path().strip_prefix(log_dir).unwrap_or(entry.path());
            let name = format!("{LOGS_SECTION}/{}", archive_path(relative));
            if append_tolerant(writer, &name, entry.path(), LOGS_SECTION, warnings)? {
                added += 1;
            }
        }
        Ok(added)
    }
}

/// Append one adjunct file, turning read failures into warnings
fn append_tolerant(
    writer: &mut ArtifactWriter,
    name: &str,
    path: &Path,
    section: &str,
    warnings: &mut Vec<BackupError>,
) -> Result<bool> {
    match writer.append_file(name, path) {
        Ok(()) => Ok(true),
        Err(BackupError::Io(e)) => {
            warnings.push(BackupError::partial_section(
                section,
                format!("{}: {}", path.display(), e),
            ));
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Forward-slash path for tar entry names
fn archive_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Builds full and safety backups
pub struct FullBackupBuilder {
    catalog: Arc<BackupCatalog>,
    store: Arc<dyn Datastore>,
    layout: BackupLayout,
    adjuncts: AdjunctSources,
}

impl FullBackupBuilder {
    pub fn new(
        catalog: Arc<BackupCatalog>,
        store: Arc<dyn Datastore>,
        layout: BackupLayout,
        adjuncts: AdjunctSources,
    ) -> Self {
        Self {
            catalog,
            store,
            layout,
            adjuncts,
        }
    }

    pub fn build(&self, request: &FullBackupRequest) -> Result<FullBackupOutcome> {
        // Stamped before the dump: the next incremental picks up anything
        // written after this instant
        let created_at = self.catalog.next_timestamp()?;
        let dump = self.store.dump()?;
        let tables = self.store.tables()?;

        self.layout.ensure_dirs()?;
        let identity =
            self.layout
                .allocate_identity(&self.catalog, request.class, request.kind, created_at)?;
        let final_path = self.layout.artifact_path(request.class, &identity);

        let mut manifest = ArtifactManifest::new(request.kind, request.class, created_at);
        manifest.description = request.description.clone();
        manifest.tables = tables;

        let mut writer = ArtifactWriter::create(final_path)?;
        writer.append_bytes(DATABASE_ENTRY, dump.as_bytes())?;

        let mut warnings = Vec::new();
        if request.include_config && self.adjuncts.append_config(&mut writer, &mut warnings)? > 0 {
            manifest.sections.push(CONFIG_SECTION.to_string());
        }
        if request.include_logs && self.adjuncts.append_logs(&mut writer, &mut warnings)? > 0 {
            manifest.sections.push(LOGS_SECTION.to_string());
        }
        for warning in &warnings {
            tracing::warn!("{}", warning);
        }

        let manifest_bytes = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| BackupError::artifact_write(&identity, e))?;
        writer.append_bytes(MANIFEST_ENTRY, &manifest_bytes)?;
        let path = writer.finish()?;

        let record = register_artifact(&self.catalog, &path, identity, &manifest)?;
        tracing::info!(
            "Created {} backup {} ({} bytes, {} tables)",
            record.kind,
            record.identity,
            record.size_bytes,
            manifest.tables.len()
        );

        Ok(FullBackupOutcome {
            record,
            path,
            warnings,
        })
    }
}

//! Backup artifacts on disk
//!
//! An artifact is a gzip-compressed tar archive:
//!
//! ```text
//! <class>_<kind>_<YYYYmmdd_HHMMSS_mmm>.tar.gz
//!     ├─ database.sql | delta.sql   replayable SQL
//!     ├─ config/<file>              full backups only, best effort
//!     ├─ logs/<path>                full backups only, best effort
//!     └─ manifest.json              kind, timestamps, format version, instructions
//! ```
//!
//! Archives are written to a `.partial` file and renamed into place once
//! complete, so a class directory never holds a half-written artifact under a
//! final name.

use crate::backup::error::{BackupError, Result};
use crate::backup::record::{BackupClass, BackupKind, BackupRecord};
use crate::catalog::BackupCatalog;
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder, Header};
use uuid::Uuid;

pub const FORMAT_VERSION: u32 = 1;
pub const MANIFEST_ENTRY: &str = "manifest.json";
pub const DATABASE_ENTRY: &str = "database.sql";
pub const DELTA_ENTRY: &str = "delta.sql";

const ARTIFACT_SUFFIX: &str = ".tar.gz";
const INCONSISTENCY_MARKER: &str = "RESTORE_INCONSISTENT";

/// Directory layout under the backup root
#[derive(Debug, Clone)]
pub struct BackupLayout {
    root: PathBuf,
}

impl BackupLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the root and every class directory
    pub fn ensure_dirs(&self) -> io::Result<()> {
        for class in BackupClass::ALL {
            fs::create_dir_all(self.class_dir(class))?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn class_dir(&self, class: BackupClass) -> PathBuf {
        self.root.join(class.dir_name())
    }

    pub fn artifact_path(&self, class: BackupClass, identity: &str) -> PathBuf {
        self.class_dir(class).join(identity)
    }

    /// Marker left behind when a restore could not be rolled back
    pub fn inconsistency_marker(&self) -> PathBuf {
        self.root.join(INCONSISTENCY_MARKER)
    }

    /// Pick an identity that is neither cataloged nor present on disk
    pub fn allocate_identity(
        &self,
        catalog: &BackupCatalog,
        class: BackupClass,
        kind: BackupKind,
        created_at: DateTime<Utc>,
    ) -> Result<String> {
        let stem = format!("{}_{}_{}", class, kind, created_at.format("%Y%m%d_%H%M%S_%3f"));
        let mut identity = format!("{stem}{ARTIFACT_SUFFIX}");
        let mut attempt = 1;
        while catalog.contains(&identity)? || self.artifact_path(class, &identity).exists() {
            identity = format!("{stem}_{attempt}{ARTIFACT_SUFFIX}");
            attempt += 1;
        }
        Ok(identity)
    }

    /// Find a record's artifact, checking its own class directory first
    pub fn locate(&self, record: &BackupRecord) -> Option<PathBuf> {
        std::iter::once(record.class)
            .chain(BackupClass::ALL.into_iter().filter(|c| *c != record.class))
            .map(|class| self.artifact_path(class, &record.identity))
            .find(|path| path.is_file())
    }

    /// Finished artifact files in a class directory
    pub fn list_class_files(&self, class: BackupClass) -> io::Result<Vec<PathBuf>> {
        let dir = self.class_dir(class);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut files: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.ends_with(ARTIFACT_SUFFIX))
            })
            .collect();
        files.sort();
        Ok(files)
    }
}

/// Self-description embedded in every artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub artifact_id: Uuid,
    pub format_version: u32,
    pub kind: BackupKind,
    pub class: BackupClass,
    pub created_at: DateTime<Utc>,
    pub description: Option<String>,
    /// Anchor backup of an incremental delta
    pub parent: Option<String>,
    /// Tables in the dump, or tables touched by the delta
    pub tables: Vec<String>,
    /// Changed rows per table, incremental backups only
    pub row_changes: BTreeMap<String, usize>,
    /// Adjunct sections that made it into the archive
    pub sections: Vec<String>,
    pub generator: String,
    pub restore_instructions: String,
}

impl ArtifactManifest {
    pub fn new(kind: BackupKind, class: BackupClass, created_at: DateTime<Utc>) -> Self {
        Self {
            artifact_id: Uuid::new_v4(),
            format_version: FORMAT_VERSION,
            kind,
            class,
            created_at,
            description: None,
            parent: None,
            tables: Vec::new(),
            row_changes: BTreeMap::new(),
            sections: Vec::new(),
            generator: concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION")).to_string(),
            restore_instructions: restore_instructions(kind),
        }
    }

    /// Archive entry holding the replayable script for this kind
    pub fn script_entry(&self) -> &'static str {
        if self.kind.is_self_contained() {
            DATABASE_ENTRY
        } else {
            DELTA_ENTRY
        }
    }
}

fn restore_instructions(kind: BackupKind) -> String {
    match kind {
        BackupKind::Full | BackupKind::Safety => format!(
            "Self-contained backup. Restore with `backupctl restore --backup-path <this file>`. \
             Manual restore: extract {DATABASE_ENTRY} and replay it into an empty SQLite \
             database (`sqlite3 app.db < {DATABASE_ENTRY}`)."
        ),
        BackupKind::Incremental => format!(
            "Incremental backup of rows changed since the parent backup named in this manifest. \
             Restore with `backupctl restore --backup-path <this file>`, which replays the \
             parent chain first. Manual restore: restore the root full backup, then apply each \
             {DELTA_ENTRY} of the chain oldest first (`sqlite3 app.db < {DELTA_ENTRY}`). \
             Rows deleted after the parent backup are not removed."
        ),
    }
}

/// Streaming writer for one archive
pub struct ArtifactWriter {
    final_path: PathBuf,
    partial_path: PathBuf,
    builder: Option<Builder<GzEncoder<File>>>,
    finished: bool,
}

impl ArtifactWriter {
    pub fn create(final_path: PathBuf) -> Result<Self> {
        if final_path.exists() {
            return Err(BackupError::artifact_write(&final_path, "file already exists"));
        }
        let mut partial = final_path.clone().into_os_string();
        partial.push(".partial");
        let partial_path = PathBuf::from(partial);

        let file = File::create(&partial_path)
            .map_err(|e| BackupError::artifact_write(&partial_path, e))?;

        Ok(Self {
            final_path,
            partial_path,
            builder: Some(Builder::new(GzEncoder::new(file, Compression::default()))),
            finished: false,
        })
    }

    /// Append an in-memory entry
    pub fn append_bytes(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        let mut header = Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(Utc::now().timestamp().max(0) as u64);
        header.set_cksum();

        let path = self.partial_path.clone();
        self.builder()?
            .append_data(&mut header, name, bytes)
            .map_err(|e| BackupError::artifact_write(&path, e))
    }

    /// Append a file from disk
    ///
    /// The source is read completely before anything is written, so a read
    /// failure leaves the archive untouched and is reported as an I/O error.
    pub fn append_file(&mut self, name: &str, source: &Path) -> Result<()> {
        let bytes = fs::read(source)?;
        self.append_bytes(name, &bytes)
    }

    /// Flush, fsync and move the archive to its final name
    pub fn finish(mut self) -> Result<PathBuf> {
        let path = self.partial_path.clone();
        let builder = self.builder.take().ok_or_else(|| {
            BackupError::artifact_write(&path, "archive already finished")
        })?;

        let encoder = builder
            .into_inner()
            .map_err(|e| BackupError::artifact_write(&path, e))?;
        let file = encoder
            .finish()
            .map_err(|e| BackupError::artifact_write(&path, e))?;
        file.sync_all()
            .map_err(|e| BackupError::artifact_write(&path, e))?;
        drop(file);

        fs::rename(&self.partial_path, &self.final_path)
            .map_err(|e| BackupError::artifact_write(&self.final_path, e))?;
        self.finished = true;

        Ok(self.final_path.clone())
    }

    fn builder(&mut self) -> Result<&mut Builder<GzEncoder<File>>> {
        let path = self.partial_path.clone();
        self.builder
            .as_mut()
            .ok_or_else(|| BackupError::artifact_write(path, "archive already finished"))
    }
}

impl Drop for ArtifactWriter {
    fn drop(&mut self) {
        if !self.finished {
            self.builder.take();
            if fs::remove_file(&self.partial_path).is_ok() {
                tracing::debug!("Removed unfinished artifact {}", self.partial_path.display());
            }
        }
    }
}

/// Decoded manifest and replay script of an artifact
#[derive(Debug, Clone)]
pub struct ArtifactContents {
    pub manifest: ArtifactManifest,
    pub script: String,
}

/// Read and decode an artifact
///
/// Reads the gzip stream to the end so a corrupted trailer (CRC) is reported
/// too.
pub fn read_artifact(path: &Path) -> Result<ArtifactContents> {
    let invalid = |message: String| BackupError::invalid_artifact(path, message);

    let file = File::open(path)?;
    let mut archive = Archive::new(GzDecoder::new(BufReader::new(file)));
    let mut manifest: Option<ArtifactManifest> = None;
    let mut scripts: BTreeMap<String, String> = BTreeMap::new();

    for entry in archive.entries().map_err(|e| invalid(e.to_string()))? {
        let mut entry = entry.map_err(|e| invalid(e.to_string()))?;
        let name = entry
            .path()
            .map_err(|e| invalid(e.to_string()))?
            .to_string_lossy()
            .into_owned();

        match name.as_str() {
            MANIFEST_ENTRY => {
                let mut raw = String::new();
                entry
                    .read_to_string(&mut raw)
                    .map_err(|e| invalid(e.to_string()))?;
                manifest = Some(
                    serde_json::from_str(&raw)
                        .map_err(|e| invalid(format!("unreadable manifest: {e}")))?,
                );
            }
            DATABASE_ENTRY | DELTA_ENTRY => {
                let mut script = String::new();
                entry
                    .read_to_string(&mut script)
                    .map_err(|e| invalid(e.to_string()))?;
                scripts.insert(name, script);
            }
            _ => {}
        }
    }

    io::copy(&mut archive.into_inner(), &mut io::sink()).map_err(|e| invalid(e.to_string()))?;

    let manifest = manifest.ok_or_else(|| invalid(format!("missing {MANIFEST_ENTRY}")))?;
    if manifest.format_version > FORMAT_VERSION {
        return Err(invalid(format!(
            "format version {} is newer than supported version {}",
            manifest.format_version, FORMAT_VERSION
        )));
    }
    let script = scripts
        .remove(manifest.script_entry())
        .ok_or_else(|| invalid(format!("missing {}", manifest.script_entry())))?;

    Ok(ArtifactContents { manifest, script })
}

/// Checksum a finished artifact and append its catalog entry
///
/// The artifact is deleted if either step fails, so the backup root never
/// holds a finished file the catalog does not know about.
pub fn register_artifact(
    catalog: &BackupCatalog,
    path: &Path,
    identity: String,
    manifest: &ArtifactManifest,
) -> Result<BackupRecord> {
    let result = (|| -> Result<BackupRecord> {
        let record = BackupRecord {
            identity,
            class: manifest.class,
            kind: manifest.kind,
            size_bytes: fs::metadata(path)?.len(),
            checksum: compute_checksum(path)?,
            created_at: manifest.created_at,
            description: manifest.description.clone(),
            is_compressed: true,
            restoration_count: 0,
            last_verified_at: None,
            parent: manifest.parent.clone(),
        };
        catalog.insert(&record)?;
        Ok(record)
    })();

    if let Err(err) = &result {
        tracing::warn!("Discarding artifact {} after catalog failure: {}", path.display(), err);
        if let Err(remove_err) = fs::remove_file(path) {
            tracing::error!("Failed to remove {}: {}", path.display(), remove_err);
        }
    }
    result
}

/// SHA-256 of a file, hex encoded
pub fn compute_checksum(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

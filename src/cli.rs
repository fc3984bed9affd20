/// CLI argument parsing and command handling

use crate::backup::{
    BackupClass, BackupEngine, BackupListing, FullBackupRequest, IncrementalOutcome,
    IncrementalRequest, VerificationReport,
};
use crate::config::{Config, ErrorContextExt, Result};
use crate::scheduler::BackupScheduler;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "backupctl")]
#[command(author, version, about = "Backup, verify and restore the application datastore", long_about = None)]
pub struct Cli {
    /// Config file (TOML); environment variables override it
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a backup
    Create {
        /// Backup type: daily, weekly, monthly or manual
        #[arg(short = 't', long = "type", default_value = "manual")]
        class: BackupClass,

        /// Bundle recent logs into the archive
        #[arg(long)]
        include_logs: bool,

        /// Only back up rows changed since the latest backup
        #[arg(short, long)]
        incremental: bool,

        /// Free-form description stored in the catalog
        #[arg(short, long)]
        description: Option<String>,
    },

    /// List backups, newest first
    List {
        /// Only show one backup type
        #[arg(short = 't', long = "type")]
        class: Option<BackupClass>,
    },

    /// Apply retention policies
    Cleanup,

    /// Restore the datastore from a backup
    Restore {
        /// Backup file or identity
        #[arg(short, long)]
        backup_path: String,

        /// Do not check the artifact checksum before restoring
        #[arg(long)]
        skip_checksum: bool,
    },

    /// Verify a backup without touching the datastore
    Verify {
        /// Backup file or identity
        #[arg(short, long)]
        backup_path: String,
    },

    /// Run the backup scheduler until interrupted
    Schedule,
}

/// Execute a parsed command line
pub async fn run(cli: Cli) -> Result<ExitCode> {
    let config = Config::load(cli.config.as_deref())?;
    if config.debug {
        config.print_summary();
    }
    let engine = Arc::new(BackupEngine::open(&config).catalog_context("open")?);

    match cli.command {
        Commands::Create {
            class,
            include_logs,
            incremental,
            description,
        } => {
            if incremental {
                let request = IncrementalRequest {
                    class,
                    description,
                    include_logs,
                };
                match engine.create_incremental(request).await.backup_context("incremental")? {
                    IncrementalOutcome::Created { record, path, row_changes } => {
                        println!("✓ Created incremental backup {}", record.identity);
                        println!("  Path:   {}", path.display());
                        println!("  Parent: {}", record.parent.as_deref().unwrap_or("-"));
                        println!("  Rows:   {}", row_changes.values().sum::<usize>());
                    }
                    IncrementalOutcome::FellBackToFull(outcome) => {
                        println!("No previous backup; created full backup instead");
                        println!("✓ Created full backup {}", outcome.record.identity);
                        println!("  Path: {}", outcome.path.display());
                        print_warnings(&outcome.warnings);
                    }
                    IncrementalOutcome::NoChanges { anchor } => {
                        println!("No changes since {}; nothing to back up", anchor.identity);
                    }
                }
            } else {
                let request = FullBackupRequest::new(class)
                    .with_description(description)
                    .with_logs(include_logs);
                let outcome = engine.create_full(request).await.backup_context("full")?;
                println!("✓ Created full backup {}", outcome.record.identity);
                println!("  Path:     {}", outcome.path.display());
                println!("  Size:     {}", format_size(outcome.record.size_bytes));
                println!("  Checksum: {}", outcome.record.checksum);
                print_warnings(&outcome.warnings);
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::List { class } => {
            let listing = engine.list(class).catalog_context("list")?;
            print_listing(&listing);
            Ok(ExitCode::SUCCESS)
        }

        Commands::Cleanup => {
            let report = engine.cleanup().await.backup_context("cleanup")?;
            println!(
                "✓ Removed {} backups, freed {}",
                report.removed.len(),
                format_size(report.freed_bytes)
            );
            for identity in &report.removed {
                println!("  - {}", identity);
            }
            for identity in &report.protected {
                println!("  kept (incremental chain): {}", identity);
            }
            for identity in &report.skipped {
                println!("  skipped (in use): {}", identity);
            }
            for identity in &report.failed {
                println!("  ✗ could not delete: {}", identity);
            }
            for orphan in &report.orphans {
                println!("  orphan (not cataloged): {}", orphan.display());
            }
            Ok(if report.failed.is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }

        Commands::Restore {
            backup_path,
            skip_checksum,
        } => {
            let identity = engine.resolve(&backup_path).restore_context(&backup_path)?;
            let outcome = engine
                .restore(&identity, !skip_checksum)
                .await
                .restore_context(&identity)?;
            println!("✓ Restored {}", outcome.restored.identity);
            if outcome.chain.len() > 1 {
                println!("  Replayed chain: {}", outcome.chain.join(" → "));
            }
            println!("  Safety backup: {}", outcome.safety.identity);
            println!("  Times restored: {}", outcome.restored.restoration_count);
            Ok(ExitCode::SUCCESS)
        }

        Commands::Verify { backup_path } => {
            let identity = engine.resolve(&backup_path).backup_context("verify")?;
            let report = engine.verify(&identity).await.backup_context("verify")?;
            print_report(&report);
            Ok(if report.valid {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }

        Commands::Schedule => {
            let scheduler = Arc::new(
                BackupScheduler::new(engine, config.schedule_interval()).catalog_context("schedule")?,
            );
            scheduler
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("Failed to listen for Ctrl-C: {}", e);
                    }
                })
                .await;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_warnings(warnings: &[crate::backup::BackupError]) {
    for warning in warnings {
        println!("  ⚠ {}", warning);
    }
}

fn print_listing(listing: &BackupListing) {
    if let Some(marker) = &listing.inconsistency_marker {
        println!("✗ A failed restore left the datastore inconsistent, see {}", marker.display());
    }
    if listing.backups.is_empty() {
        println!("No backups found");
        return;
    }

    println!(
        "{:<48} {:<8} {:<12} {:>10} {:<20} {:>8}",
        "IDENTITY", "TYPE", "KIND", "SIZE", "CREATED", "RESTORED"
    );
    for listed in &listing.backups {
        let record = &listed.record;
        println!(
            "{:<48} {:<8} {:<12} {:>10} {:<20} {:>8}{}",
            record.identity,
            record.class,
            record.kind,
            format_size(record.size_bytes),
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            record.restoration_count,
            if listed.location.is_none() { "  (missing)" } else { "" }
        );
    }
}

fn print_report(report: &VerificationReport) {
    let mark = |ok: bool| if ok { "✓" } else { "✗" };
    println!("Verification of {}", report.identity);
    println!("  {} size check", mark(report.size_check));
    println!("  {} checksum check", mark(report.checksum_check));
    println!(
        "  {} restoration test ({} tables)",
        mark(report.restoration_test),
        report.tables_restored
    );
    for error in &report.errors {
        println!("  - {}", error);
    }
    println!("{} {}", mark(report.valid), if report.valid { "VALID" } else { "INVALID" });
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_create() {
        let cli = Cli::try_parse_from([
            "backupctl", "create", "--type", "weekly", "--incremental", "-d", "before upgrade",
        ])
        .unwrap();
        match cli.command {
            Commands::Create {
                class,
                incremental,
                include_logs,
                description,
            } => {
                assert_eq!(class, BackupClass::Weekly);
                assert!(incremental);
                assert!(!include_logs);
                assert_eq!(description.as_deref(), Some("before upgrade"));
            }
            _ => panic!("expected create"),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_type() {
        assert!(Cli::try_parse_from(["backupctl", "list", "--type", "hourly"]).is_err());
    }

    #[test]
    fn test_parse_restore_with_global_config() {
        let cli = Cli::try_parse_from([
            "backupctl",
            "restore",
            "--backup-path",
            "/srv/backups/manual/x.tar.gz",
            "--skip-checksum",
            "--config",
            "backup.toml",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("backup.toml")));
        assert!(matches!(
            cli.command,
            Commands::Restore { skip_checksum: true, .. }
        ));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
    }
}

//! Backup Engine - Command line entry point
//!
//! One-shot operator commands plus a `daemon` mode that runs the configured
//! schedules until SIGINT/SIGTERM.

use anyhow::{bail, Result};
use backup_engine::{
    config::Config, daemon::shutdown::ShutdownCoordinator, scheduler::Scheduler, utils,
    BackupCategory, BackupEngine, BackupSummary,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a backup of every protected item
    Backup {
        #[arg(short = 't', long, default_value = "manual")]
        category: BackupCategory,

        #[arg(long)]
        label: Option<String>,

        /// Only hash the live data and print what would be stored
        #[arg(long)]
        dry_run: bool,
    },

    /// List valid backups, newest first
    List {
        #[arg(short = 't', long)]
        category: Option<BackupCategory>,
    },

    /// Aggregate statistics over all backups
    Stats,

    /// Print the manifest of a backup
    Show { backup_id: String },

    /// Re-check a stored backup against its manifest
    Verify { backup_id: String },

    /// Restore a backup into staging, optionally promoting it into the live root
    Restore {
        backup_id: String,

        /// Where to create the staging directory (kept after exit)
        #[arg(long, value_name = "DIR")]
        staging_dir: Option<PathBuf>,

        /// Replace live data with the restored items
        #[arg(long)]
        promote: bool,
    },

    /// Delete a backup
    Delete { backup_id: String },

    /// Apply retention limits
    Retention {
        /// Only this category (default: all)
        #[arg(short = 't', long)]
        category: Option<BackupCategory>,

        /// Also prune manual and emergency backups
        #[arg(long)]
        include_exempt: bool,
    },

    /// Run the configured schedules until interrupted
    Daemon,

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };

    if let Command::Config = args.command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level, config.log.json)?;

    tracing::info!(
        "Starting backup-engine v{} (live: {}, backups: {})",
        env!("CARGO_PKG_VERSION"),
        config.engine.live_root.display(),
        config.engine.backup_root.display()
    );

    let engine = Arc::new(BackupEngine::open(config).await?);
    let json = args.json;

    match args.command {
        Command::Backup {
            category,
            label,
            dry_run,
        } => {
            if dry_run {
                let snapshot = engine.live_snapshot().await?;
                print_json(&snapshot)?;
            } else {
                let summary = engine.create_backup(category, label.as_deref()).await?;
                output(json, &summary, || print_summaries(std::slice::from_ref(&summary)))?;
            }
        }
        Command::List { category } => {
            let backups = engine.list_backups(category).await?;
            output(json, &backups, || print_summaries(&backups))?;
        }
        Command::Stats => {
            let stats = engine.get_backup_stats().await?;
            output(json, &stats, || {
                println!("Backups:     {}", stats.count);
                println!("Stored size: {}", format_bytes(stats.total_size));
                println!("Data size:   {}", format_bytes(stats.total_uncompressed_size));
                if let (Some(oldest), Some(newest)) = (stats.oldest, stats.newest) {
                    println!("Oldest:      {}", oldest.to_rfc3339());
                    println!("Newest:      {}", newest.to_rfc3339());
                }
                for (category, count) in &stats.by_category {
                    println!("  {:<10} {}", category, count);
                }
            })?;
        }
        Command::Show { backup_id } => {
            print_json(&engine.get_backup(&backup_id).await?)?;
        }
        Command::Verify { backup_id } => {
            let report = engine.verify_backup(&backup_id).await?;
            output(json, &report, || {
                if report.valid {
                    println!("{}: OK ({} files checked)", report.backup_id, report.checked);
                } else {
                    println!("{}: CORRUPT", report.backup_id);
                    for mismatch in &report.mismatches {
                        println!("  {}", mismatch);
                    }
                }
            })?;
            if !report.valid {
                bail!("backup {} failed verification", backup_id);
            }
        }
        Command::Restore {
            backup_id,
            staging_dir,
            promote,
        } => {
            if staging_dir.is_none() && !promote {
                tracing::warn!(
                    "Staging under the configured staging root is removed on the next run; use --staging-dir to keep it"
                );
            }
            let handle = engine
                .restore_backup_to(&backup_id, staging_dir.as_deref())
                .await?;
            if promote {
                let items = engine.promote_restore(&handle.id).await?;
                output(json, &items, || {
                    println!("Restored {} into live data:", backup_id);
                    for item in &items {
                        println!("  {}", item);
                    }
                })?;
            } else {
                output(json, &handle, || {
                    println!("Restored {} into {}", backup_id, handle.staging_path.display());
                })?;
            }
        }
        Command::Delete { backup_id } => {
            engine.delete_backup(&backup_id).await?;
            if !json {
                println!("Deleted {}", backup_id);
            }
        }
        Command::Retention {
            category,
            include_exempt,
        } => {
            let reports = match category {
                Some(category) => vec![engine.enforce_retention(category, include_exempt).await?],
                None => engine.enforce_retention_all(include_exempt).await?,
            };
            output(json, &reports, || {
                for report in &reports {
                    if let Some(category) = report.category {
                        println!(
                            "{:<10} kept {:>3}  removed {:>3}  failed {:>3}",
                            category,
                            report.kept,
                            report.removed.len(),
                            report.failed.len()
                        );
                    }
                }
            })?;
        }
        Command::Daemon => run_daemon(engine).await?,
        // Printed before the engine is opened
        Command::Config => {}
    }

    Ok(())
}

async fn run_daemon(engine: Arc<BackupEngine>) -> Result<()> {
    let schedules = engine.config().schedule.clone();
    if schedules.is_empty() {
        bail!("no schedules configured");
    }

    // Create shutdown coordinator sharing the engine's cancellation token
    let shutdown_coordinator = ShutdownCoordinator::new(engine.shutdown_token());
    let scheduler = Scheduler::new(engine.clone(), schedules).start(shutdown_coordinator.token());

    // Wait for shutdown signal
    shutdown_coordinator.wait_for_signal().await;

    // Let a running backup stop at its next item and clean up
    shutdown_coordinator
        .drain(scheduler, Duration::from_secs(30))
        .await;

    Ok(())
}

fn output<T: Serialize>(json: bool, value: &T, human: impl FnOnce()) -> Result<()> {
    if json {
        print_json(value)
    } else {
        human();
        Ok(())
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_summaries(backups: &[BackupSummary]) {
    if backups.is_empty() {
        println!("No backups");
        return;
    }
    for backup in backups {
        println!(
            "{:<30} {:<10} {:>5} files {:>10} {}",
            backup.backup_id,
            backup.category,
            backup.file_count,
            format_bytes(backup.stored_size),
            backup.label.as_deref().unwrap_or("")
        );
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

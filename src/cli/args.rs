//! CLI argument definitions using clap
//!
//! Commands:
//! - freightvault backup:create [--type] [--name] [--retention-days]
//! - freightvault backup:scheduled [--schedule-id] [--dry-run] [--limit]
//! - freightvault backup:cleanup [--retention-days] [--type]
//! - freightvault backup:status
//! - freightvault backup:restore --backup-id [--actor]
//! - freightvault backup:history [--limit]
//! - freightvault rate:quote --length --width --height [--exchange-rate]

use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::path::PathBuf;

use crate::models::BackupType;

/// Backups, restores and sea-freight quotes for the forwarding back office
#[derive(Parser, Debug)]
#[command(name = "freightvault")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "config.json")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a backup now
    #[command(name = "backup:create")]
    BackupCreate {
        /// database, files or full
        #[arg(long = "type", default_value = "full")]
        backup_type: BackupType,

        #[arg(long)]
        name: Option<String>,

        /// Recorded with the backup; cleanup uses its own setting
        #[arg(long)]
        retention_days: Option<u32>,
    },

    /// Run every due backup schedule
    #[command(name = "backup:scheduled")]
    BackupScheduled {
        /// Run only this schedule, even if it is not due yet
        #[arg(long)]
        schedule_id: Option<i64>,

        /// List what would run without creating backups
        #[arg(long)]
        dry_run: bool,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Delete backups older than the retention period
    #[command(name = "backup:cleanup")]
    BackupCleanup {
        /// Defaults to default_retention_days from the configuration
        #[arg(long)]
        retention_days: Option<u32>,

        #[arg(long = "type")]
        backup_type: Option<BackupType>,
    },

    /// Show recent backups and whether a restore is running
    #[command(name = "backup:status")]
    BackupStatus {
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Restore a recorded backup
    #[command(name = "backup:restore")]
    BackupRestore {
        #[arg(long)]
        backup_id: i64,

        /// User id recorded in the restore log
        #[arg(long)]
        actor: Option<i64>,
    },

    /// Show past restore attempts
    #[command(name = "backup:history")]
    BackupHistory {
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Price a sea-freight package
    #[command(name = "rate:quote")]
    RateQuote {
        /// Inches
        #[arg(long)]
        length: Decimal,

        /// Inches
        #[arg(long)]
        width: Decimal,

        /// Inches
        #[arg(long)]
        height: Decimal,

        #[arg(long, default_value = "1")]
        exchange_rate: Decimal,
    },
}

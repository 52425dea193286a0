//! Command handlers. Each returns `Ok(true)` on success and `Ok(false)` when
//! the operation ran but failed; `Err` is reserved for setup problems.

use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use std::path::Path;
use std::sync::Arc;

use super::args::{Cli, Command};
use crate::backup::{BackupOptions, BackupService, DatabaseBackupHandler, FileBackupHandler};
use crate::config::BackupConfig;
use crate::models::{BackupType, OperationResult};
use crate::pricing::{SeaPackage, SeaRateCalculator};
use crate::restore::{FileMaintenanceController, MaintenanceController, RestoreLock, RestoreService};
use crate::schedule::{RunOptions, ScheduledBackupRunner};
use crate::store::{PgStore, Store};
use crate::utils::process::TokioProcessRunner;

struct Services {
    config: Arc<BackupConfig>,
    store: Arc<dyn Store>,
    backups: Arc<BackupService>,
    restores: RestoreService,
    maintenance: Arc<FileMaintenanceController>,
}

pub async fn run(cli: Cli) -> Result<bool> {
    let config = Arc::new(
        BackupConfig::load(&cli.config)
            .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?,
    );
    let store = open_store(&config).await?;

    match cli.command {
        Command::BackupCreate {
            backup_type,
            name,
            retention_days,
        } => {
            let services = build_services(config, store)?;
            println!("🚀 Creating {} backup...", backup_type);
            let result = services
                .backups
                .create_manual_backup(BackupOptions {
                    name,
                    retention_days,
                    ..BackupOptions::new(backup_type)
                })
                .await;
            Ok(report(&result))
        }
        Command::BackupScheduled {
            schedule_id,
            dry_run,
            limit,
        } => {
            let services = build_services(config, store)?;
            let runner = ScheduledBackupRunner::new(services.store.clone(), services.backups.clone());
            let summary = runner
                .run_due(
                    RunOptions {
                        schedule_id,
                        dry_run,
                        limit,
                    },
                    Utc::now(),
                )
                .await;

            for outcome in &summary.outcomes {
                let marker = if outcome.successful { "✅" } else { "❌" };
                println!("{} [{}] {}: {}", marker, outcome.schedule_id, outcome.name, outcome.message);
            }
            if dry_run {
                println!("Dry run: {} schedule(s) due", summary.outcomes.len());
            } else {
                println!("Succeeded: {}, Failed: {}", summary.succeeded, summary.failed);
            }
            for error in &summary.errors {
                eprintln!("❌ {}", error);
            }
            Ok(summary.is_success())
        }
        Command::BackupCleanup {
            retention_days,
            backup_type,
        } => {
            let services = build_services(config, store)?;
            let retention = retention_days.unwrap_or(services.config.default_retention_days);
            let report = services.backups.cleanup_old_backups(retention, backup_type).await;
            println!(
                "🧹 Removed {} backup(s) older than {} days, freed {}",
                report.removed,
                retention,
                format_size(report.freed_bytes)
            );
            if report.removed_snapshots > 0 {
                println!("   Pruned {} pre-restore snapshot(s)", report.removed_snapshots);
            }
            for error in &report.errors {
                eprintln!("❌ {}", error);
            }
            Ok(report.errors.is_empty())
        }
        Command::BackupStatus { limit } => {
            let services = build_services(config, store)?;
            print_status(&services, limit).await?;
            Ok(true)
        }
        Command::BackupRestore { backup_id, actor } => {
            let services = build_services(config, store)?;
            println!("🔄 Restoring backup {}...", backup_id);
            let result = services.restores.restore_backup(backup_id, actor).await;
            Ok(report(&result))
        }
        Command::BackupHistory { limit } => {
            let services = build_services(config, store)?;
            let history = services.restores.get_restoration_history(limit).await?;
            if history.is_empty() {
                println!("No restore attempts recorded.");
            }
            for entry in history {
                let marker = if entry.status == crate::models::RestoreStatus::Completed { "✅" } else { "❌" };
                println!(
                    "{} #{} {} {} from {} by {} at {}{}",
                    marker,
                    entry.id,
                    entry.restore_type,
                    entry.status,
                    entry.backup_name.as_deref().unwrap_or("a file"),
                    entry.restored_by.map_or_else(|| "system".to_string(), |a| a.to_string()),
                    entry.started_at.format("%Y-%m-%d %H:%M:%S"),
                    entry
                        .error_message
                        .as_ref()
                        .map(|e| format!(" ({})", e))
                        .unwrap_or_default()
                );
            }
            Ok(true)
        }
        Command::RateQuote {
            length,
            width,
            height,
            exchange_rate,
        } => {
            let calculator = SeaRateCalculator::from_store(store.as_ref()).await?;
            let package = SeaPackage {
                length_inches: length,
                width_inches: width,
                height_inches: height,
                exchange_rate,
            };
            match calculator.get_rate_breakdown(&package) {
                Ok(b) => {
                    println!("📦 {} cu ft (tier {})", b.cubic_feet, b.rate_range);
                    println!("   Freight:        {} x {} = {}", b.cubic_feet, b.rate_per_cubic_foot, round_money(b.freight_cost));
                    println!("   Processing fee: {}", round_money(b.processing_fee));
                    println!("   Subtotal:       {}", round_money(b.subtotal));
                    println!("   Exchange rate:  {}", b.exchange_rate);
                    println!("✅ Total:          {}", round_money(b.total));
                    Ok(true)
                }
                Err(e) => {
                    println!("❌ {}", e);
                    Ok(false)
                }
            }
        }
    }
}

async fn open_store(config: &BackupConfig) -> Result<Arc<dyn Store>> {
    let url = config.database_url()?;
    let store = PgStore::connect(url)
        .await
        .context("Failed to connect to the application database")?;
    store.migrate().await.context("Failed to apply schema")?;
    Ok(Arc::new(store))
}

fn build_services(config: Arc<BackupConfig>, store: Arc<dyn Store>) -> Result<Services> {
    let maintenance = Arc::new(FileMaintenanceController::new(&config.maintenance_flag_path));
    if maintenance.clear_stale(config.lock_stale_after)? {
        tracing::warn!("stale maintenance flag from an interrupted restore was cleared");
    }

    let database = Arc::new(DatabaseBackupHandler::new(
        config.clone(),
        Arc::new(TokioProcessRunner),
    ));
    let files = Arc::new(FileBackupHandler::new(config.clone()));
    let backups = Arc::new(BackupService::new(
        config.clone(),
        store.clone(),
        database.clone(),
        files.clone(),
    ));
    let restores = RestoreService::new(
        config.clone(),
        store.clone(),
        database,
        files,
        maintenance.clone(),
    );
    Ok(Services {
        config,
        store,
        backups,
        restores,
        maintenance,
    })
}

async fn print_status(services: &Services, limit: usize) -> Result<()> {
    let config = &services.config;
    println!("📁 Storage root: {}", config.storage_root.display());
    println!(
        "🔧 Maintenance mode: {}",
        if services.maintenance.is_enabled() { "ON" } else { "off" }
    );
    if RestoreLock::is_held(&config.restore_lock_path) {
        println!("⚠️  A restore is in progress ({})", config.restore_lock_path.display());
    }

    let backups = services.backups.list_backups(limit).await?;
    if backups.is_empty() {
        println!("No backups recorded.");
        return Ok(());
    }
    for backup in &backups {
        let marker = match backup.status {
            crate::models::BackupStatus::Completed => "✅",
            crate::models::BackupStatus::Failed => "❌",
        };
        println!(
            "{} #{} {:<8} {:>10} {} {} {}",
            marker,
            backup.id,
            backup.backup_type,
            format_size(backup.file_size.max(0) as u64),
            backup.created_at.format("%Y-%m-%d %H:%M"),
            backup.name,
            artifact_state(&backup.file_path, backup.status)
        );
    }

    for backup_type in [BackupType::Database, BackupType::Files, BackupType::Full] {
        if let Some(latest) = backups
            .iter()
            .find(|b| b.backup_type == backup_type && b.status == crate::models::BackupStatus::Completed)
        {
            println!("   Latest {}: {}", backup_type, latest.created_at.format("%Y-%m-%d %H:%M"));
        }
    }
    Ok(())
}

fn artifact_state(path: &Path, status: crate::models::BackupStatus) -> &'static str {
    match status {
        crate::models::BackupStatus::Completed if !path.exists() => "(artifact missing)",
        _ => "",
    }
}

/// Prints a service result and returns whether it succeeded.
fn report(result: &OperationResult) -> bool {
    if result.successful {
        println!("✅ {}", result.message);
        for key in ["file_path", "file_size", "checksum", "pre_restore_backup", "restore_log_id", "restore_log_error"] {
            if let Some(value) = result.get(key).filter(|v| !v.is_null()) {
                println!("   {}: {}", key, value);
            }
        }
    } else {
        eprintln!("❌ {}", result.message);
        if let Some(error) = result.get("error").and_then(|v| v.as_str()) {
            if !result.message.contains(error) {
                eprintln!("   {}", error);
            }
        }
    }
    result.successful
}

fn round_money(value: Decimal) -> Decimal {
    value.round_dp(2)
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
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(5 * 1024 * 1024 + 512 * 1024), "5.5 MB");
    }

    #[test]
    fn test_report_returns_outcome() {
        assert!(report(&OperationResult::success("done").with("file_size", 10)));
        assert!(!report(&OperationResult::failure("nope").with("error", "boom")));
    }
}

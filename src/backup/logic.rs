use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use super::archive::FileBackupHandler;
use super::db_dump::DatabaseBackupHandler;
use crate::config::BackupConfig;
use crate::errors::{AppError, Result};
use crate::models::{
    Backup, BackupResult, BackupStatus, BackupType, NewBackup, OperationResult,
};
use crate::store::Store;
use crate::utils::naming::artifact_file_name;
use crate::utils::sha256_file;

/// What a single backup run should produce.
#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub backup_type: BackupType,
    pub name: Option<String>,
    pub retention_days: Option<u32>,
    /// Overrides whether the database is included; defaults from `backup_type`.
    pub database: Option<bool>,
    /// Overrides whether directories are included; defaults from `backup_type`.
    pub files: Option<bool>,
    pub scheduled: bool,
    pub schedule_id: Option<i64>,
    pub created_by: Option<i64>,
}

impl BackupOptions {
    pub fn new(backup_type: BackupType) -> Self {
        Self {
            backup_type,
            name: None,
            retention_days: None,
            database: None,
            files: None,
            scheduled: false,
            schedule_id: None,
            created_by: None,
        }
    }

    /// Type of the artifact after applying the `database`/`files` overrides.
    pub fn effective_type(&self) -> Option<BackupType> {
        let database = self.database.unwrap_or(self.backup_type.includes_database());
        let files = self.files.unwrap_or(self.backup_type.includes_files());
        match (database, files) {
            (true, true) => Some(BackupType::Full),
            (true, false) => Some(BackupType::Database),
            (false, true) => Some(BackupType::Files),
            (false, false) => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub removed: usize,
    pub freed_bytes: u64,
    pub removed_snapshots: usize,
    pub errors: Vec<String>,
}

pub struct BackupService {
    config: Arc<BackupConfig>,
    store: Arc<dyn Store>,
    database: Arc<DatabaseBackupHandler>,
    files: Arc<FileBackupHandler>,
}

impl BackupService {
    pub fn new(
        config: Arc<BackupConfig>,
        store: Arc<dyn Store>,
        database: Arc<DatabaseBackupHandler>,
        files: Arc<FileBackupHandler>,
    ) -> Self {
        Self {
            config,
            store,
            database,
            files,
        }
    }

    /// Runs one backup and records it. Never returns an error: failures are
    /// reported through the result, partial artifacts are removed and a
    /// `failed` row is written.
    pub async fn create_manual_backup(&self, options: BackupOptions) -> BackupResult {
        let Some(backup_type) = options.effective_type() else {
            return OperationResult::failure(
                "Nothing to back up: both database and files were excluded",
            );
        };

        let started = Instant::now();
        let now = Utc::now();
        let name = options
            .name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("{} backup {}", backup_type, now.format("%Y-%m-%d %H:%M")));
        let extension = match backup_type {
            BackupType::Database => "sql",
            BackupType::Files | BackupType::Full => "tar.gz",
        };
        let file_path = self
            .config
            .artifact_dir(backup_type.as_str())
            .join(artifact_file_name(&name, now, extension));

        tracing::info!(
            backup_type = %backup_type,
            name = %name,
            scheduled = options.scheduled,
            schedule_id = ?options.schedule_id,
            "🚀 backup started"
        );

        match self.produce_artifact(backup_type, &file_path).await {
            Ok(()) => {
                self.record_success(&options, backup_type, name, file_path, started)
                    .await
            }
            Err(e) => {
                remove_if_exists(&file_path);
                self.record_failure(&options, backup_type, name, file_path, e, started)
                    .await
            }
        }
    }

    async fn produce_artifact(&self, backup_type: BackupType, file_path: &Path) -> Result<()> {
        match backup_type {
            BackupType::Database => {
                self.database.create_dump(file_path).await?;
                ensure_valid_dump(&self.database, file_path)
            }
            BackupType::Files => {
                let dirs = &self.config.backup_directories;
                if dirs.is_empty() {
                    return Err(AppError::Validation(
                        "No backup directories are configured".to_string(),
                    ));
                }
                self.files.create_bundle(dirs, None, file_path)
            }
            BackupType::Full => {
                fs::create_dir_all(&self.config.storage_root)?;
                let staging = tempfile::Builder::new()
                    .prefix(".full-")
                    .tempdir_in(&self.config.storage_root)?;
                let dump = staging.path().join("dump.sql");
                self.database.create_dump(&dump).await?;
                ensure_valid_dump(&self.database, &dump)?;
                if self.config.backup_directories.is_empty() {
                    tracing::warn!("full backup requested with no backup directories configured");
                }
                self.files
                    .create_bundle(&self.config.backup_directories, Some(&dump), file_path)
            }
        }
    }

    async fn record_success(
        &self,
        options: &BackupOptions,
        backup_type: BackupType,
        name: String,
        file_path: PathBuf,
        started: Instant,
    ) -> BackupResult {
        let digest = sha256_file(&file_path).and_then(|checksum| {
            let size = fs::metadata(&file_path)?.len();
            Ok((checksum, size))
        });
        let (checksum, size) = match digest {
            Ok(v) => v,
            Err(e) => {
                remove_if_exists(&file_path);
                return self
                    .record_failure(options, backup_type, name, file_path, e, started)
                    .await;
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let new_backup = NewBackup {
            name,
            backup_type,
            file_path: file_path.clone(),
            file_size: size as i64,
            status: BackupStatus::Completed,
            checksum: Some(checksum.clone()),
            created_by: options.created_by,
            metadata: json!({
                "scheduled": options.scheduled,
                "schedule_id": options.schedule_id,
                "retention_days": options.retention_days.unwrap_or(self.config.default_retention_days),
                "directories": self.directories_for(backup_type),
                "duration_ms": duration_ms,
            }),
        };

        match self.store.insert_backup(new_backup).await {
            Ok(backup) => {
                tracing::info!(
                    backup_id = backup.id,
                    backup_type = %backup_type,
                    file = %file_path.display(),
                    size_bytes = size,
                    duration_ms,
                    "✅ backup completed"
                );
                OperationResult::success(format!("Backup '{}' created successfully", backup.name))
                    .with("backup_id", backup.id)
                    .with("type", backup_type.as_str())
                    .with("file_path", file_path.to_string_lossy().into_owned())
                    .with("file_size", size)
                    .with("checksum", checksum)
                    .with("duration_ms", duration_ms)
            }
            Err(e) => {
                // An artifact nobody can find through the table is an orphan.
                remove_if_exists(&file_path);
                tracing::error!(error = %e, file = %file_path.display(), "backup record could not be saved");
                OperationResult::failure(format!("Backup record could not be saved: {}", e))
                    .with("error", e.to_string())
            }
        }
    }

    async fn record_failure(
        &self,
        options: &BackupOptions,
        backup_type: BackupType,
        name: String,
        file_path: PathBuf,
        error: AppError,
        started: Instant,
    ) -> BackupResult {
        let message = format!("Backup failed: {}", error);
        tracing::error!(
            backup_type = %backup_type,
            scheduled = options.scheduled,
            error = %error,
            "❌ backup failed"
        );

        let failed = NewBackup {
            name,
            backup_type,
            file_path,
            file_size: 0,
            status: BackupStatus::Failed,
            checksum: None,
            created_by: options.created_by,
            metadata: json!({
                "scheduled": options.scheduled,
                "schedule_id": options.schedule_id,
                "error": error.to_string(),
                "duration_ms": started.elapsed().as_millis() as u64,
            }),
        };

        let mut result = OperationResult::failure(message).with("error", error.to_string());
        match self.store.insert_backup(failed).await {
            Ok(row) => result = result.with("backup_id", row.id),
            Err(e) => tracing::warn!(error = %e, "failed backup could not be recorded"),
        }
        result
    }

    fn directories_for(&self, backup_type: BackupType) -> Vec<String> {
        if backup_type.includes_files() {
            self.config
                .backup_directories
                .iter()
                .map(|d| d.to_string_lossy().into_owned())
                .collect()
        } else {
            Vec::new()
        }
    }

    /// Deletes backups older than `retention_days`: the artifact first, then the
    /// row. A row is kept when its artifact cannot be removed. Without a type
    /// filter, pre-restore snapshots past the cutoff are pruned as well.
    pub async fn cleanup_old_backups(
        &self,
        retention_days: u32,
        backup_type: Option<BackupType>,
    ) -> CleanupReport {
        let mut report = CleanupReport::default();
        if retention_days == 0 {
            report
                .errors
                .push("Retention days must be greater than zero".to_string());
            return report;
        }

        let cutoff = Utc::now() - ChronoDuration::days(i64::from(retention_days));
        let expired = match self.store.backups_created_before(cutoff, backup_type).await {
            Ok(rows) => rows,
            Err(e) => {
                report.errors.push(format!("Could not list old backups: {}", e));
                return report;
            }
        };

        for backup in expired {
            match remove_artifact(&backup) {
                Ok(freed) => report.freed_bytes += freed,
                Err(e) => {
                    report.errors.push(format!(
                        "Could not delete {} for backup {}: {}",
                        backup.file_path.display(),
                        backup.id,
                        e
                    ));
                    continue;
                }
            }
            match self.store.delete_backup(backup.id).await {
                Ok(()) => {
                    report.removed += 1;
                    tracing::debug!(backup_id = backup.id, "expired backup removed");
                }
                Err(e) => report
                    .errors
                    .push(format!("Could not delete record for backup {}: {}", backup.id, e)),
            }
        }

        if backup_type.is_none() {
            match prune_directory(&self.config.artifact_dir("pre-restore"), cutoff) {
                Ok(count) => report.removed_snapshots = count,
                Err(e) => report
                    .errors
                    .push(format!("Could not prune pre-restore snapshots: {}", e)),
            }
        }

        tracing::info!(
            retention_days,
            backup_type = ?backup_type,
            removed = report.removed,
            freed_bytes = report.freed_bytes,
            errors = report.errors.len(),
            "backup cleanup finished"
        );
        report
    }

    pub async fn list_backups(&self, limit: usize) -> Result<Vec<Backup>> {
        self.store.list_backups(limit).await
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }
}

fn ensure_valid_dump(handler: &DatabaseBackupHandler, path: &Path) -> Result<()> {
    if handler.validate_dump(path) {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "pg_dump output at {} failed validation",
            path.display()
        )))
    }
}

fn remove_if_exists(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            tracing::warn!(path = %path.display(), error = %e, "could not remove partial artifact");
        }
    }
}

/// Returns the number of bytes freed; a missing artifact frees nothing.
fn remove_artifact(backup: &Backup) -> std::io::Result<u64> {
    match fs::metadata(&backup.file_path) {
        Ok(meta) => {
            fs::remove_file(&backup.file_path)?;
            Ok(meta.len())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

fn prune_directory(dir: &Path, cutoff: chrono::DateTime<Utc>) -> std::io::Result<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let cutoff: std::time::SystemTime = cutoff.into();
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_file() && meta.modified()? < cutoff {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

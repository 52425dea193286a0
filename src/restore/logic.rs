use chrono::{DateTime, Utc};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use super::lock::RestoreLock;
use super::maintenance::{MaintenanceController, MaintenanceGuard};
use super::verification::{ensure_readable, verify_backup};
use crate::backup::{DatabaseBackupHandler, FileBackupHandler};
use crate::config::BackupConfig;
use crate::errors::{AppError, Result};
use crate::models::{
    BackupType, NewRestoreLog, OperationResult, RestoreHistoryEntry, RestoreResult,
    RestoreStatus, RestoreType,
};
use crate::store::Store;
use crate::utils::naming::artifact_file_name;

const NOT_READABLE: &str = "Backup file not found or not readable";
const VALIDATION_FAILED: &str = "Backup file validation failed";

/// Who asked for a restore and which recorded backup it came from.
#[derive(Debug, Clone, Copy, Default)]
pub struct RestoreContext {
    pub backup_id: Option<i64>,
    pub actor: Option<i64>,
}

enum Plan<'a> {
    Database {
        dump: &'a Path,
    },
    Files {
        archive: &'a Path,
        targets: &'a [PathBuf],
    },
    Full {
        dump: &'a Path,
        archive: &'a Path,
        targets: &'a [PathBuf],
    },
}

impl<'a> Plan<'a> {
    fn kind(&self) -> &'static str {
        match self {
            Plan::Database { .. } => "database",
            Plan::Files { .. } => "files",
            Plan::Full { .. } => "full",
        }
    }

    fn dump(&self) -> Option<&'a Path> {
        match self {
            Plan::Database { dump } | Plan::Full { dump, .. } => Some(*dump),
            Plan::Files { .. } => None,
        }
    }

    fn directories(&self) -> Option<(&'a Path, &'a [PathBuf])> {
        match self {
            Plan::Files { archive, targets } | Plan::Full { archive, targets, .. }
                if !targets.is_empty() =>
            {
                Some((*archive, *targets))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct Snapshots {
    database: Option<PathBuf>,
    files: Option<PathBuf>,
}

impl Snapshots {
    fn primary(&self) -> Option<&PathBuf> {
        self.database.as_ref().or(self.files.as_ref())
    }
}

struct Attempt {
    ctx: RestoreContext,
    restore_type: RestoreType,
    source: PathBuf,
    started_at: DateTime<Utc>,
    timer: Instant,
}

struct Failure {
    error: AppError,
    /// None when nothing had been changed yet, so no rollback was attempted.
    rollback: Option<Result<()>>,
}

/// Restores databases and directories from backups, with a pre-restore
/// snapshot and automatic rollback.
pub struct RestoreService {
    config: Arc<BackupConfig>,
    store: Arc<dyn Store>,
    database: Arc<DatabaseBackupHandler>,
    files: Arc<FileBackupHandler>,
    maintenance: Arc<dyn MaintenanceController>,
}

impl RestoreService {
    pub fn new(
        config: Arc<BackupConfig>,
        store: Arc<dyn Store>,
        database: Arc<DatabaseBackupHandler>,
        files: Arc<FileBackupHandler>,
        maintenance: Arc<dyn MaintenanceController>,
    ) -> Self {
        Self {
            config,
            store,
            database,
            files,
            maintenance,
        }
    }

    /// Replays a SQL dump into the live database.
    ///
    /// Missing or invalid input is refused without a restore log. Once the
    /// attempt is underway a log is always written, and a failed replay is
    /// rolled back from the pre-restore dump.
    pub async fn restore_database(&self, path: &Path, ctx: RestoreContext) -> RestoreResult {
        let attempt = self.begin(ctx, RestoreType::Database, path);
        if let Err(e) = ensure_readable(path) {
            return reject(&attempt, NOT_READABLE, e);
        }
        if !self.database.validate_dump(path) {
            return reject(
                &attempt,
                VALIDATION_FAILED,
                AppError::Validation(format!("{} is not a usable SQL dump", path.display())),
            );
        }
        self.execute(attempt, Plan::Database { dump: path }).await
    }

    /// Replaces `targets` with their copies from a files archive.
    pub async fn restore_files(
        &self,
        path: &Path,
        targets: &[PathBuf],
        ctx: RestoreContext,
    ) -> RestoreResult {
        let attempt = self.begin(ctx, RestoreType::Files, path);
        if let Err(e) = ensure_readable(path) {
            return reject(&attempt, NOT_READABLE, e);
        }
        let checked = self
            .files
            .inspect_archive(path)
            .and_then(|manifest| manifest.ensure_covers(targets));
        if let Err(e) = checked {
            return reject(&attempt, VALIDATION_FAILED, e);
        }
        self.execute(attempt, Plan::Files { archive: path, targets })
            .await
    }

    /// Restores a recorded backup after checking its status and checksum.
    pub async fn restore_backup(&self, backup_id: i64, actor: Option<i64>) -> RestoreResult {
        let ctx = RestoreContext {
            backup_id: Some(backup_id),
            actor,
        };
        let backup = match self.store.get_backup(backup_id).await {
            Ok(Some(backup)) => backup,
            Ok(None) => {
                return OperationResult::failure(format!("Backup {} not found", backup_id));
            }
            Err(e) => {
                return OperationResult::failure(format!("Could not load backup {}: {}", backup_id, e))
                    .with("error", e.to_string());
            }
        };
        if let Err(e) = verify_backup(&backup) {
            tracing::warn!(backup_id, error = %e, "backup refused before restore");
            return OperationResult::failure(VALIDATION_FAILED).with("error", e.to_string());
        }

        match backup.backup_type {
            BackupType::Database => self.restore_database(&backup.file_path, ctx).await,
            BackupType::Files => {
                let targets = match self.files.inspect_archive(&backup.file_path) {
                    Ok(manifest) => manifest.covered(&self.config.backup_directories),
                    Err(e) => {
                        return OperationResult::failure(VALIDATION_FAILED)
                            .with("error", e.to_string());
                    }
                };
                self.restore_files(&backup.file_path, &targets, ctx).await
            }
            BackupType::Full => self.restore_full(&backup.file_path, ctx).await,
        }
    }

    /// A full bundle restores its embedded dump first, then the configured
    /// directories it carries. Logged as a database restore.
    async fn restore_full(&self, path: &Path, ctx: RestoreContext) -> RestoreResult {
        let attempt = self.begin(ctx, RestoreType::Database, path);
        if let Err(e) = ensure_readable(path) {
            return reject(&attempt, NOT_READABLE, e);
        }
        let manifest = match self.files.inspect_archive(path) {
            Ok(manifest) => manifest,
            Err(e) => return reject(&attempt, VALIDATION_FAILED, e),
        };
        let targets = manifest.covered(&self.config.backup_directories);

        let staging = match fs::create_dir_all(&self.config.storage_root).and_then(|_| {
            tempfile::Builder::new()
                .prefix(".restore-dump-")
                .tempdir_in(&self.config.storage_root)
        }) {
            Ok(dir) => dir,
            Err(e) => return reject(&attempt, "Could not prepare restore staging", e.into()),
        };
        let dump = staging.path().join("dump.sql");
        if let Err(e) = self.files.extract_database_dump(path, &dump) {
            return reject(&attempt, VALIDATION_FAILED, e);
        }
        if !self.database.validate_dump(&dump) {
            return reject(
                &attempt,
                VALIDATION_FAILED,
                AppError::Validation("embedded database dump is not usable".to_string()),
            );
        }

        self.execute(
            attempt,
            Plan::Full {
                dump: &dump,
                archive: path,
                targets: &targets,
            },
        )
        .await
    }

    /// Replays a pre-restore database dump. Returns whether it succeeded.
    pub async fn rollback_restore(&self, pre_restore_path: &Path) -> bool {
        match self.rollback_database(pre_restore_path).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(snapshot = %pre_restore_path.display(), error = %e, "database rollback failed");
                false
            }
        }
    }

    /// Puts `targets` back the way a pre-restore file snapshot recorded them.
    pub async fn rollback_file_restore(&self, pre_restore_path: &Path, targets: &[PathBuf]) -> bool {
        match self.rollback_files(pre_restore_path, targets) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(snapshot = %pre_restore_path.display(), error = %e, "file rollback failed");
                false
            }
        }
    }

    pub async fn get_restoration_history(&self, limit: usize) -> Result<Vec<RestoreHistoryEntry>> {
        self.store.restore_history(limit).await
    }

    fn begin(&self, ctx: RestoreContext, restore_type: RestoreType, source: &Path) -> Attempt {
        let started_at = Utc::now();
        tracing::info!(
            backup_id = ?ctx.backup_id,
            actor = ?ctx.actor,
            restore_type = %restore_type,
            source = %source.display(),
            started_at = %started_at.to_rfc3339(),
            "restoration started"
        );
        Attempt {
            ctx,
            restore_type,
            source: source.to_path_buf(),
            started_at,
            timer: Instant::now(),
        }
    }

    async fn execute(&self, attempt: Attempt, plan: Plan<'_>) -> RestoreResult {
        let _lock = match RestoreLock::acquire(
            &self.config.restore_lock_path,
            self.config.lock_stale_after,
        ) {
            Ok(lock) => lock,
            Err(e) => return reject(&attempt, "Another restoration is already in progress", e),
        };

        let snapshots = match self.take_snapshots(&plan).await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                let failure = Failure {
                    error: AppError::Validation(format!("Pre-restore backup failed: {}", e)),
                    rollback: None,
                };
                return self
                    .finish(attempt, &plan, Snapshots::default(), Err(failure))
                    .await;
            }
        };
        tracing::info!(
            backup_id = ?attempt.ctx.backup_id,
            actor = ?attempt.ctx.actor,
            restore_type = %attempt.restore_type,
            database_snapshot = ?snapshots.database,
            files_snapshot = ?snapshots.files,
            elapsed_ms = attempt.timer.elapsed().as_millis() as u64,
            "pre-restore backup created"
        );

        let outcome = {
            let reason = format!("{} restore in progress", plan.kind());
            match MaintenanceGuard::enable(self.maintenance.as_ref(), &reason) {
                Ok(_guard) => self.apply(&plan, &snapshots).await,
                Err(error) => Err(Failure {
                    error,
                    rollback: None,
                }),
            }
        };

        self.finish(attempt, &plan, snapshots, outcome).await
    }

    async fn take_snapshots(&self, plan: &Plan<'_>) -> Result<Snapshots> {
        let mut snapshots = Snapshots::default();
        if plan.dump().is_some() {
            let target = self
                .config
                .artifact_dir("pre-restore")
                .join(artifact_file_name("pre_restore_database", Utc::now(), "sql"));
            snapshots.database = Some(self.database.create_dump(&target).await?);
        }
        if let Some((_, targets)) = plan.directories() {
            snapshots.files = Some(self.files.create_pre_restore_backup(targets)?);
        }
        Ok(snapshots)
    }

    async fn apply(&self, plan: &Plan<'_>, snapshots: &Snapshots) -> std::result::Result<(), Failure> {
        if let Some(dump) = plan.dump() {
            if let Err(error) = self.database.restore_dump(dump).await {
                let rollback = self.roll_back(snapshots, None).await;
                return Err(Failure {
                    error,
                    rollback: Some(rollback),
                });
            }
        }
        if let Some((archive, targets)) = plan.directories() {
            if let Err(error) = self.files.restore_directories(archive, targets) {
                let rollback = self.roll_back(snapshots, Some(targets)).await;
                return Err(Failure {
                    error,
                    rollback: Some(rollback),
                });
            }
        }
        Ok(())
    }

    /// Rolls back every snapshot taken; the first error wins.
    async fn roll_back(&self, snapshots: &Snapshots, targets: Option<&[PathBuf]>) -> Result<()> {
        let mut first_error = None;
        if let Some(snapshot) = &snapshots.database {
            if let Err(e) = self.rollback_database(snapshot).await {
                first_error.get_or_insert(e);
            }
        }
        if let (Some(snapshot), Some(targets)) = (&snapshots.files, targets) {
            if let Err(e) = self.rollback_files(snapshot, targets) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn rollback_database(&self, snapshot: &Path) -> Result<()> {
        tracing::warn!(snapshot = %snapshot.display(), "rolling back database from pre-restore backup");
        self.database
            .restore_dump(snapshot)
            .await
            .map_err(|e| AppError::Rollback(e.to_string()))
    }

    fn rollback_files(&self, snapshot: &Path, targets: &[PathBuf]) -> Result<()> {
        tracing::warn!(snapshot = %snapshot.display(), "rolling back directories from pre-restore backup");
        self.files
            .restore_directories(snapshot, targets)
            .map_err(|e| AppError::Rollback(e.to_string()))
    }

    async fn finish(
        &self,
        attempt: Attempt,
        plan: &Plan<'_>,
        snapshots: Snapshots,
        outcome: std::result::Result<(), Failure>,
    ) -> RestoreResult {
        let duration_ms = attempt.timer.elapsed().as_millis() as u64;
        let pre_restore = snapshots
            .primary()
            .map(|p| p.to_string_lossy().into_owned());
        let directories: Vec<String> = plan
            .directories()
            .map(|(_, targets)| {
                targets
                    .iter()
                    .map(|t| t.to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        let mut metadata = json!({
            "source": attempt.source.to_string_lossy(),
            "backup_type": plan.kind(),
            "directories": directories,
            "duration_ms": duration_ms,
            "database_snapshot": snapshots.database.as_ref().map(|p| p.to_string_lossy().into_owned()),
            "files_snapshot": snapshots.files.as_ref().map(|p| p.to_string_lossy().into_owned()),
        });

        let (status, error_message, result) = match outcome {
            Ok(()) => {
                tracing::info!(
                    backup_id = ?attempt.ctx.backup_id,
                    actor = ?attempt.ctx.actor,
                    restore_type = %attempt.restore_type,
                    duration_ms,
                    "✅ restoration completed"
                );
                let result = OperationResult::success("Restoration completed successfully")
                    .with("pre_restore_backup", pre_restore.clone())
                    .with("duration_ms", duration_ms);
                (RestoreStatus::Completed, None, result)
            }
            Err(Failure { error, rollback }) => {
                let rollback_error = rollback.as_ref().and_then(|r| r.as_ref().err()).map(|e| e.to_string());
                let message = match (&rollback, &rollback_error) {
                    (None, _) => format!("Restoration failed: {}", error),
                    (Some(_), None) => format!(
                        "Restoration failed: {}. The previous state was restored from the pre-restore backup",
                        error
                    ),
                    (Some(_), Some(rollback_error)) => format!(
                        "Restoration failed: {}. {}. Manual recovery is required from {}",
                        error,
                        rollback_error,
                        pre_restore.as_deref().unwrap_or("the pre-restore backup")
                    ),
                };

                tracing::error!(
                    backup_id = ?attempt.ctx.backup_id,
                    actor = ?attempt.ctx.actor,
                    restore_type = %attempt.restore_type,
                    duration_ms,
                    error = %error,
                    "❌ restoration failed"
                );
                if let Some(rollback_error) = &rollback_error {
                    tracing::error!(
                        backup_id = ?attempt.ctx.backup_id,
                        pre_restore = ?pre_restore,
                        error = %rollback_error,
                        "rollback failed, live data may be inconsistent"
                    );
                }

                metadata["rollback_performed"] = json!(rollback.is_some());
                metadata["rollback_failed"] = json!(rollback_error.is_some());
                metadata["rollback_error"] = json!(rollback_error);

                let result = OperationResult::failure(message)
                    .with("error", error.to_string())
                    .with("pre_restore_backup", pre_restore.clone())
                    .with("rollback_performed", rollback.is_some())
                    .with("rollback_failed", rollback_error.is_some())
                    .with("rollback_error", rollback_error);
                (RestoreStatus::Failed, Some(error.to_string()), result)
            }
        };

        let log = NewRestoreLog {
            backup_id: attempt.ctx.backup_id,
            restored_by: attempt.ctx.actor,
            restore_type: attempt.restore_type,
            status,
            started_at: attempt.started_at,
            completed_at: Utc::now(),
            pre_restore_backup_path: snapshots.primary().cloned(),
            error_message,
            metadata,
        };
        match self.store.insert_restore_log(log).await {
            Ok(row) => result.with("restore_log_id", row.id),
            Err(e) => {
                tracing::error!(
                    backup_id = ?attempt.ctx.backup_id,
                    error = %e,
                    "restore log could not be written"
                );
                let mut result = result.with("restore_log_error", e.to_string());
                result.message = format!(
                    "{} The restore log could not be written: {}",
                    result.message, e
                );
                result
            }
        }
    }
}

/// Refusal before anything was touched; no restore log is written.
fn reject(attempt: &Attempt, message: &str, error: AppError) -> RestoreResult {
    tracing::warn!(
        backup_id = ?attempt.ctx.backup_id,
        actor = ?attempt.ctx.actor,
        restore_type = %attempt.restore_type,
        source = %attempt.source.display(),
        error = %error,
        "restoration rejected"
    );
    OperationResult::failure(message).with("error", error.to_string())
}

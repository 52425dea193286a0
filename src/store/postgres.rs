// freightvault/src/store/postgres.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::path::PathBuf;

use super::Store;
use crate::errors::{AppError, Result};
use crate::models::{
    Backup, BackupSchedule, BackupType, NewBackup, NewRestoreLog, RateType, RestoreHistoryEntry,
    RestoreLog, ShippingRate,
};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const BACKUP_COLUMNS: &str =
    "id, name, type, file_path, file_size, status, checksum, created_by, metadata, created_at, updated_at";

const SCHEDULE_COLUMNS: &str =
    "id, name, type, frequency, time, retention_days, is_active, last_run_at, next_run_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Applies the pending migrations under `migrations/`.
    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await?;
        tracing::debug!("backup tables are in place");
        Ok(())
    }
}

fn parse_column<T: std::str::FromStr<Err = AppError>>(row: &PgRow, column: &str) -> Result<T> {
    let raw: String = row.try_get(column)?;
    raw.parse()
}

fn backup_from_row(row: &PgRow) -> Result<Backup> {
    Ok(Backup {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        backup_type: parse_column(row, "type")?,
        file_path: PathBuf::from(row.try_get::<String, _>("file_path")?),
        file_size: row.try_get("file_size")?,
        status: parse_column(row, "status")?,
        checksum: row.try_get("checksum")?,
        created_by: row.try_get("created_by")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn restore_log_from_row(row: &PgRow) -> Result<RestoreLog> {
    Ok(RestoreLog {
        id: row.try_get("id")?,
        backup_id: row.try_get("backup_id")?,
        restored_by: row.try_get("restored_by")?,
        restore_type: parse_column(row, "restore_type")?,
        status: parse_column(row, "status")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        pre_restore_backup_path: row
            .try_get::<Option<String>, _>("pre_restore_backup_path")?
            .map(PathBuf::from),
        error_message: row.try_get("error_message")?,
        metadata: row.try_get("metadata")?,
    })
}

fn schedule_from_row(row: &PgRow) -> Result<BackupSchedule> {
    let retention: i32 = row.try_get("retention_days")?;
    Ok(BackupSchedule {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        backup_type: parse_column(row, "type")?,
        frequency: parse_column(row, "frequency")?,
        time: row.try_get("time")?,
        retention_days: u32::try_from(retention).unwrap_or(0),
        is_active: row.try_get("is_active")?,
        last_run_at: row.try_get("last_run_at")?,
        next_run_at: row.try_get("next_run_at")?,
    })
}

fn path_to_text(path: &std::path::Path) -> String {
    path.to_string_lossy().into_owned()
}

#[async_trait]
impl Store for PgStore {
    async fn insert_backup(&self, backup: NewBackup) -> Result<Backup> {
        let sql = format!(
            "INSERT INTO backups (name, type, file_path, file_size, status, checksum, created_by, metadata)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING {}",
            BACKUP_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(&backup.name)
            .bind(backup.backup_type.as_str())
            .bind(path_to_text(&backup.file_path))
            .bind(backup.file_size)
            .bind(backup.status.as_str())
            .bind(&backup.checksum)
            .bind(backup.created_by)
            .bind(&backup.metadata)
            .fetch_one(&self.pool)
            .await?;
        backup_from_row(&row)
    }

    async fn get_backup(&self, id: i64) -> Result<Option<Backup>> {
        let sql = format!("SELECT {} FROM backups WHERE id = $1", BACKUP_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(backup_from_row).transpose()
    }

    async fn list_backups(&self, limit: usize) -> Result<Vec<Backup>> {
        let sql = format!(
            "SELECT {} FROM backups ORDER BY created_at DESC, id DESC LIMIT $1",
            BACKUP_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(backup_from_row).collect()
    }

    async fn backups_created_before(
        &self,
        cutoff: DateTime<Utc>,
        backup_type: Option<BackupType>,
    ) -> Result<Vec<Backup>> {
        let sql = format!(
            "SELECT {} FROM backups
             WHERE created_at < $1 AND ($2::text IS NULL OR type = $2)
             ORDER BY created_at ASC",
            BACKUP_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(cutoff)
            .bind(backup_type.map(|t| t.as_str()))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(backup_from_row).collect()
    }

    async fn delete_backup(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM backups WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("backup {}", id)));
        }
        Ok(())
    }

    async fn insert_restore_log(&self, log: NewRestoreLog) -> Result<RestoreLog> {
        let row = sqlx::query(
            "INSERT INTO restore_logs
                (backup_id, restored_by, restore_type, status, started_at, completed_at,
                 pre_restore_backup_path, error_message, metadata)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             RETURNING id, backup_id, restored_by, restore_type, status, started_at, completed_at,
                       pre_restore_backup_path, error_message, metadata",
        )
        .bind(log.backup_id)
        .bind(log.restored_by)
        .bind(log.restore_type.as_str())
        .bind(log.status.as_str())
        .bind(log.started_at)
        .bind(log.completed_at)
        .bind(log.pre_restore_backup_path.as_deref().map(path_to_text))
        .bind(&log.error_message)
        .bind(&log.metadata)
        .fetch_one(&self.pool)
        .await?;
        restore_log_from_row(&row)
    }

    async fn restore_history(&self, limit: usize) -> Result<Vec<RestoreHistoryEntry>> {
        let rows = sqlx::query(
            "SELECT r.id, r.backup_id, b.name AS backup_name, r.restore_type, r.status,
                    r.restored_by, r.started_at, r.completed_at,
                    r.pre_restore_backup_path, r.error_message
             FROM restore_logs r
             LEFT JOIN backups b ON b.id = r.backup_id
             ORDER BY r.started_at DESC, r.id DESC
             LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(RestoreHistoryEntry {
                    id: row.try_get("id")?,
                    backup_id: row.try_get("backup_id")?,
                    backup_name: row.try_get("backup_name")?,
                    restore_type: parse_column(row, "restore_type")?,
                    status: parse_column(row, "status")?,
                    restored_by: row.try_get("restored_by")?,
                    started_at: row.try_get("started_at")?,
                    completed_at: row.try_get("completed_at")?,
                    pre_restore_backup_path: row
                        .try_get::<Option<String>, _>("pre_restore_backup_path")?
                        .map(PathBuf::from),
                    error_message: row.try_get("error_message")?,
                })
            })
            .collect()
    }

    async fn get_schedule(&self, id: i64) -> Result<Option<BackupSchedule>> {
        let sql = format!("SELECT {} FROM backup_schedules WHERE id = $1", SCHEDULE_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(schedule_from_row).transpose()
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<BackupSchedule>> {
        let sql = format!(
            "SELECT {} FROM backup_schedules
             WHERE is_active AND (next_run_at IS NULL OR next_run_at <= $1)
             ORDER BY next_run_at ASC NULLS FIRST, id ASC",
            SCHEDULE_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(now).fetch_all(&self.pool).await?;
        rows.iter().map(schedule_from_row).collect()
    }

    async fn mark_schedule_run(
        &self,
        id: i64,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE backup_schedules SET last_run_at = $2, next_run_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(last_run_at)
        .bind(next_run_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("backup schedule {}", id)));
        }
        Ok(())
    }

    async fn list_rates(&self, rate_type: RateType) -> Result<Vec<ShippingRate>> {
        let rows = sqlx::query(
            "SELECT id, type, min_cubic_feet, max_cubic_feet, price_per_cubic_foot, processing_fee
             FROM shipping_rates WHERE type = $1 ORDER BY min_cubic_feet ASC",
        )
        .bind(rate_type.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ShippingRate {
                    id: row.try_get("id")?,
                    rate_type: parse_column(row, "type")?,
                    min_cubic_feet: row.try_get("min_cubic_feet")?,
                    max_cubic_feet: row.try_get("max_cubic_feet")?,
                    price_per_cubic_foot: row.try_get("price_per_cubic_foot")?,
                    processing_fee: row.try_get("processing_fee")?,
                })
            })
            .collect()
    }
}

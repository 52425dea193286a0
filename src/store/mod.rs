//! Persistence for backups, restore logs, schedules and shipping rates.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::Result;
use crate::models::{
    Backup, BackupSchedule, BackupType, NewBackup, NewRestoreLog, RateType, RestoreHistoryEntry,
    RestoreLog, ShippingRate,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Tables that record backups and restores. Dumps leave them out so replaying
/// an older dump never rewinds the bookkeeping of later backups.
pub const BOOKKEEPING_TABLES: &[&str] = &[
    "backups",
    "restore_logs",
    "backup_schedules",
    "_sqlx_migrations",
];

#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_backup(&self, backup: NewBackup) -> Result<Backup>;

    async fn get_backup(&self, id: i64) -> Result<Option<Backup>>;

    /// Most recent first.
    async fn list_backups(&self, limit: usize) -> Result<Vec<Backup>>;

    /// Rows created strictly before `cutoff`, optionally limited to one type.
    async fn backups_created_before(
        &self,
        cutoff: DateTime<Utc>,
        backup_type: Option<BackupType>,
    ) -> Result<Vec<Backup>>;

    async fn delete_backup(&self, id: i64) -> Result<()>;

    async fn insert_restore_log(&self, log: NewRestoreLog) -> Result<RestoreLog>;

    /// Most recent first.
    async fn restore_history(&self, limit: usize) -> Result<Vec<RestoreHistoryEntry>>;

    async fn get_schedule(&self, id: i64) -> Result<Option<BackupSchedule>>;

    /// Active schedules whose `next_run_at` is unset or not after `now`.
    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<BackupSchedule>>;

    async fn mark_schedule_run(
        &self,
        id: i64,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Ordered by `min_cubic_feet` ascending.
    async fn list_rates(&self, rate_type: RateType) -> Result<Vec<ShippingRate>>;
}

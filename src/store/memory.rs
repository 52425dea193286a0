//! In-memory store for tests and for embedding the services without PostgreSQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::Store;
use crate::errors::{AppError, Result};
use crate::models::{
    Backup, BackupSchedule, BackupType, NewBackup, NewRestoreLog, RateType, RestoreHistoryEntry,
    RestoreLog, ShippingRate,
};

#[derive(Debug, Default)]
struct State {
    backups: Vec<Backup>,
    restore_logs: Vec<RestoreLog>,
    schedules: Vec<BackupSchedule>,
    rates: Vec<ShippingRate>,
    next_id: i64,
    #[cfg(test)]
    restore_log_failure: Option<String>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_schedule(&self, mut schedule: BackupSchedule) -> BackupSchedule {
        let mut state = self.state.write().await;
        schedule.id = state.next_id();
        state.schedules.push(schedule.clone());
        schedule
    }

    pub async fn add_rate(&self, mut rate: ShippingRate) -> ShippingRate {
        let mut state = self.state.write().await;
        rate.id = state.next_id();
        state.rates.push(rate.clone());
        rate
    }

    /// Overwrites `created_at`, for exercising retention.
    #[cfg(test)]
    pub async fn set_backup_created_at(&self, id: i64, at: DateTime<Utc>) {
        let mut state = self.state.write().await;
        if let Some(b) = state.backups.iter_mut().find(|b| b.id == id) {
            b.created_at = at;
        }
    }

    /// Makes every later `insert_restore_log` fail with `message`.
    #[cfg(test)]
    pub async fn reject_restore_logs(&self, message: &str) {
        self.state.write().await.restore_log_failure = Some(message.to_string());
    }

    #[cfg(test)]
    pub async fn restore_logs(&self) -> Vec<RestoreLog> {
        self.state.read().await.restore_logs.clone()
    }

    #[cfg(test)]
    pub async fn backups(&self) -> Vec<Backup> {
        self.state.read().await.backups.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_backup(&self, backup: NewBackup) -> Result<Backup> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let row = Backup {
            id: state.next_id(),
            name: backup.name,
            backup_type: backup.backup_type,
            file_path: backup.file_path,
            file_size: backup.file_size,
            status: backup.status,
            checksum: backup.checksum,
            created_by: backup.created_by,
            metadata: backup.metadata,
            created_at: now,
            updated_at: now,
        };
        state.backups.push(row.clone());
        Ok(row)
    }

    async fn get_backup(&self, id: i64) -> Result<Option<Backup>> {
        Ok(self.state.read().await.backups.iter().find(|b| b.id == id).cloned())
    }

    async fn list_backups(&self, limit: usize) -> Result<Vec<Backup>> {
        let state = self.state.read().await;
        let mut rows = state.backups.clone();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn backups_created_before(
        &self,
        cutoff: DateTime<Utc>,
        backup_type: Option<BackupType>,
    ) -> Result<Vec<Backup>> {
        let state = self.state.read().await;
        Ok(state
            .backups
            .iter()
            .filter(|b| b.created_at < cutoff)
            .filter(|b| backup_type.map_or(true, |t| b.backup_type == t))
            .cloned()
            .collect())
    }

    async fn delete_backup(&self, id: i64) -> Result<()> {
        let mut state = self.state.write().await;
        let before = state.backups.len();
        state.backups.retain(|b| b.id != id);
        if state.backups.len() == before {
            return Err(AppError::NotFound(format!("backup {}", id)));
        }
        Ok(())
    }

    async fn insert_restore_log(&self, log: NewRestoreLog) -> Result<RestoreLog> {
        let mut state = self.state.write().await;
        #[cfg(test)]
        if let Some(message) = &state.restore_log_failure {
            return Err(AppError::Validation(message.clone()));
        }
        let row = RestoreLog {
            id: state.next_id(),
            backup_id: log.backup_id,
            restored_by: log.restored_by,
            restore_type: log.restore_type,
            status: log.status,
            started_at: log.started_at,
            completed_at: log.completed_at,
            pre_restore_backup_path: log.pre_restore_backup_path,
            error_message: log.error_message,
            metadata: log.metadata,
        };
        state.restore_logs.push(row.clone());
        Ok(row)
    }

    async fn restore_history(&self, limit: usize) -> Result<Vec<RestoreHistoryEntry>> {
        let state = self.state.read().await;
        let mut entries: Vec<RestoreHistoryEntry> = state
            .restore_logs
            .iter()
            .map(|log| RestoreHistoryEntry {
                id: log.id,
                backup_id: log.backup_id,
                backup_name: log
                    .backup_id
                    .and_then(|id| state.backups.iter().find(|b| b.id == id))
                    .map(|b| b.name.clone()),
                restore_type: log.restore_type,
                status: log.status,
                restored_by: log.restored_by,
                started_at: log.started_at,
                completed_at: log.completed_at,
                pre_restore_backup_path: log.pre_restore_backup_path.clone(),
                error_message: log.error_message.clone(),
            })
            .collect();
        entries.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn get_schedule(&self, id: i64) -> Result<Option<BackupSchedule>> {
        Ok(self.state.read().await.schedules.iter().find(|s| s.id == id).cloned())
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<BackupSchedule>> {
        let state = self.state.read().await;
        let mut due: Vec<BackupSchedule> = state
            .schedules
            .iter()
            .filter(|s| s.is_active && s.next_run_at.map_or(true, |next| next <= now))
            .cloned()
            .collect();
        due.sort_by_key(|s| (s.next_run_at, s.id));
        Ok(due)
    }

    async fn mark_schedule_run(
        &self,
        id: i64,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let schedule = state
            .schedules
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| AppError::NotFound(format!("backup schedule {}", id)))?;
        schedule.last_run_at = Some(last_run_at);
        schedule.next_run_at = Some(next_run_at);
        Ok(())
    }

    async fn list_rates(&self, rate_type: RateType) -> Result<Vec<ShippingRate>> {
        let state = self.state.read().await;
        let mut rates: Vec<ShippingRate> = state
            .rates
            .iter()
            .filter(|r| r.rate_type == rate_type)
            .cloned()
            .collect();
        rates.sort_by(|a, b| a.min_cubic_feet.cmp(&b.min_cubic_feet));
        Ok(rates)
    }
}

//! Execution of due `BackupSchedule`s.

use chrono::{DateTime, Days, Months, NaiveTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::backup::{BackupOptions, BackupService};
use crate::errors::{AppError, Result};
use crate::models::{BackupSchedule, Frequency};
use crate::store::Store;

/// First occurrence of `time` strictly after `after`, stepping by `frequency`
/// from the day of `after`.
pub fn next_run(frequency: Frequency, time: NaiveTime, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let base = after.date_naive();
    for step in 0..=12u32 {
        let date = match frequency {
            Frequency::Daily => base.checked_add_days(Days::new(u64::from(step))),
            Frequency::Weekly => base.checked_add_days(Days::new(7 * u64::from(step))),
            Frequency::Monthly => base.checked_add_months(Months::new(step)),
        };
        let Some(date) = date else { break };
        let candidate = date.and_time(time).and_utc();
        if candidate > after {
            return Ok(candidate);
        }
    }
    Err(AppError::InvalidInput(format!(
        "no {} run after {} could be computed",
        frequency, after
    )))
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub schedule_id: Option<i64>,
    pub dry_run: bool,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleOutcome {
    pub schedule_id: i64,
    pub name: String,
    pub successful: bool,
    pub message: String,
    pub next_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub outcomes: Vec<ScheduleOutcome>,
    pub errors: Vec<String>,
}

impl RunSummary {
    /// True when nothing failed, including retention cleanup.
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.errors.is_empty()
    }
}

pub struct ScheduledBackupRunner {
    store: Arc<dyn Store>,
    backups: Arc<BackupService>,
}

impl ScheduledBackupRunner {
    pub fn new(store: Arc<dyn Store>, backups: Arc<BackupService>) -> Self {
        Self { store, backups }
    }

    /// Runs every due schedule (or the one named by `schedule_id`).
    ///
    /// A failed backup leaves `last_run_at`/`next_run_at` untouched so the
    /// next tick retries it. A successful one advances them and applies the
    /// schedule's retention to backups of its type.
    pub async fn run_due(&self, options: RunOptions, now: DateTime<Utc>) -> RunSummary {
        let mut summary = RunSummary::default();
        let schedules = match self.select(&options, now).await {
            Ok(schedules) => schedules,
            Err(e) => {
                summary.errors.push(e.to_string());
                return summary;
            }
        };
        tracing::info!(count = schedules.len(), dry_run = options.dry_run, "🗓️ due backup schedules");

        for schedule in schedules {
            if options.dry_run {
                summary.outcomes.push(ScheduleOutcome {
                    schedule_id: schedule.id,
                    name: schedule.name.clone(),
                    successful: true,
                    message: format!("Would run a {} backup", schedule.backup_type),
                    next_run_at: schedule.next_run_at,
                });
                continue;
            }
            let outcome = self.run_one(&schedule, now, &mut summary.errors).await;
            if outcome.successful {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
                summary.errors.push(format!("{}: {}", schedule.name, outcome.message));
            }
            summary.outcomes.push(outcome);
        }
        summary
    }

    async fn select(&self, options: &RunOptions, now: DateTime<Utc>) -> Result<Vec<BackupSchedule>> {
        if let Some(id) = options.schedule_id {
            let schedule = self
                .store
                .get_schedule(id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("Schedule {} does not exist", id)))?;
            if !schedule.is_active {
                return Err(AppError::Validation(format!("Schedule {} is inactive", id)));
            }
            return Ok(vec![schedule]);
        }

        let mut due = self.store.due_schedules(now).await?;
        due.sort_by_key(|s| (s.next_run_at, s.id));
        if let Some(limit) = options.limit {
            due.truncate(limit);
        }
        Ok(due)
    }

    async fn run_one(
        &self,
        schedule: &BackupSchedule,
        now: DateTime<Utc>,
        errors: &mut Vec<String>,
    ) -> ScheduleOutcome {
        tracing::info!(
            schedule_id = schedule.id,
            name = %schedule.name,
            backup_type = %schedule.backup_type,
            "running scheduled backup"
        );
        let result = self
            .backups
            .create_manual_backup(BackupOptions {
                name: Some(schedule.name.clone()),
                retention_days: Some(schedule.retention_days),
                scheduled: true,
                schedule_id: Some(schedule.id),
                ..BackupOptions::new(schedule.backup_type)
            })
            .await;

        if !result.successful {
            tracing::error!(schedule_id = schedule.id, message = %result.message, "scheduled backup failed");
            return ScheduleOutcome {
                schedule_id: schedule.id,
                name: schedule.name.clone(),
                successful: false,
                message: result.message,
                next_run_at: schedule.next_run_at,
            };
        }

        let next = match next_run(schedule.frequency, schedule.time, now) {
            Ok(next) => next,
            Err(e) => {
                errors.push(format!("{}: {}", schedule.name, e));
                return ScheduleOutcome {
                    schedule_id: schedule.id,
                    name: schedule.name.clone(),
                    successful: true,
                    message: result.message,
                    next_run_at: schedule.next_run_at,
                };
            }
        };
        if let Err(e) = self.store.mark_schedule_run(schedule.id, now, next).await {
            errors.push(format!("{}: could not update schedule: {}", schedule.name, e));
        }

        let report = self
            .backups
            .cleanup_old_backups(schedule.retention_days, Some(schedule.backup_type))
            .await;
        errors.extend(
            report
                .errors
                .into_iter()
                .map(|e| format!("{}: {}", schedule.name, e)),
        );

        ScheduleOutcome {
            schedule_id: schedule.id,
            name: schedule.name.clone(),
            successful: true,
            message: result.message,
            next_run_at: Some(next),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BackupType;
    use crate::test_support::service_fixture;
    use chrono::{Duration, TimeZone};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn two_am() -> NaiveTime {
        NaiveTime::from_hms_opt(2, 0, 0).unwrap()
    }

    #[test]
    fn test_next_run_daily() {
        assert_eq!(next_run(Frequency::Daily, two_am(), at(2024, 3, 10, 1, 0)).unwrap(), at(2024, 3, 10, 2, 0));
        assert_eq!(next_run(Frequency::Daily, two_am(), at(2024, 3, 10, 2, 0)).unwrap(), at(2024, 3, 11, 2, 0));
    }

    #[test]
    fn test_next_run_weekly_and_monthly() {
        assert_eq!(next_run(Frequency::Weekly, two_am(), at(2024, 3, 10, 3, 0)).unwrap(), at(2024, 3, 17, 2, 0));
        assert_eq!(next_run(Frequency::Monthly, two_am(), at(2024, 1, 31, 3, 0)).unwrap(), at(2024, 2, 29, 2, 0));
        assert_eq!(next_run(Frequency::Monthly, two_am(), at(2024, 1, 31, 1, 0)).unwrap(), at(2024, 1, 31, 2, 0));
    }

    fn schedule(name: &str, backup_type: BackupType, next_run_at: Option<DateTime<Utc>>) -> BackupSchedule {
        BackupSchedule {
            id: 0,
            name: name.to_string(),
            backup_type,
            frequency: Frequency::Daily,
            time: two_am(),
            retention_days: 7,
            is_active: true,
            last_run_at: None,
            next_run_at,
        }
    }

    #[tokio::test]
    async fn test_successful_run_advances_schedule_and_applies_retention() {
        let fx = service_fixture("v1").await;
        let now = Utc::now();
        let old = fx
            .backups
            .create_manual_backup(BackupOptions::new(BackupType::Database))
            .await;
        let old_id = old.get("backup_id").unwrap().as_i64().unwrap();
        fx.store.set_backup_created_at(old_id, now - Duration::days(30)).await;
        let nightly = fx
            .store
            .add_schedule(schedule("Nightly", BackupType::Database, Some(now - Duration::minutes(5))))
            .await;
        let runner = ScheduledBackupRunner::new(fx.store.clone(), Arc::new(fx.backup_service_with_directories(vec![fx.uploads()])));

        let summary = runner.run_due(RunOptions::default(), now).await;

        assert!(summary.is_success(), "{:?}", summary.errors);
        assert_eq!(summary.succeeded, 1);
        let updated = fx.store.get_schedule(nightly.id).await.unwrap().unwrap();
        assert_eq!(updated.last_run_at, Some(now));
        assert!(updated.next_run_at.unwrap() > now);
        let remaining = fx.store.backups().await;
        assert_eq!(remaining.len(), 1);
        assert_ne!(remaining[0].id, old_id);
        assert_eq!(remaining[0].metadata["schedule_id"], serde_json::json!(nightly.id));
    }

    #[tokio::test]
    async fn test_failed_run_leaves_schedule_for_retry() {
        let fx = service_fixture("v1").await;
        let now = Utc::now();
        let due_at = now - Duration::minutes(1);
        let nightly = fx
            .store
            .add_schedule(schedule("Nightly", BackupType::Database, Some(due_at)))
            .await;
        fx.db.fail_next_dump("pg_dump: error: could not connect");
        let runner = ScheduledBackupRunner::new(fx.store.clone(), Arc::new(fx.backup_service_with_directories(Vec::new())));

        let summary = runner.run_due(RunOptions::default(), now).await;

        assert!(!summary.is_success());
        assert_eq!(summary.failed, 1);
        assert!(summary.errors[0].starts_with("Nightly:"));
        let unchanged = fx.store.get_schedule(nightly.id).await.unwrap().unwrap();
        assert_eq!(unchanged.last_run_at, None);
        assert_eq!(unchanged.next_run_at, Some(due_at));
    }

    #[tokio::test]
    async fn test_dry_run_and_limit() {
        let fx = service_fixture("v1").await;
        let now = Utc::now();
        for (name, minutes) in [("a", 30), ("b", 20), ("c", 10)] {
            fx.store
                .add_schedule(schedule(name, BackupType::Database, Some(now - Duration::minutes(minutes))))
                .await;
        }
        fx.store
            .add_schedule(schedule("later", BackupType::Database, Some(now + Duration::hours(1))))
            .await;
        let runner = ScheduledBackupRunner::new(fx.store.clone(), Arc::new(fx.backup_service_with_directories(Vec::new())));

        let summary = runner
            .run_due(RunOptions { dry_run: true, limit: Some(2), ..RunOptions::default() }, now)
            .await;

        let names: Vec<_> = summary.outcomes.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(fx.store.backups().await.is_empty());
        assert!(fx.db.commands().is_empty());
    }

    #[tokio::test]
    async fn test_explicit_schedule_id() {
        let fx = service_fixture("v1").await;
        let now = Utc::now();
        let future = fx
            .store
            .add_schedule(schedule("weekly", BackupType::Database, Some(now + Duration::days(3))))
            .await;
        let runner = ScheduledBackupRunner::new(fx.store.clone(), Arc::new(fx.backup_service_with_directories(Vec::new())));

        let summary = runner
            .run_due(RunOptions { schedule_id: Some(future.id), ..RunOptions::default() }, now)
            .await;
        assert_eq!(summary.succeeded, 1);

        let missing = runner
            .run_due(RunOptions { schedule_id: Some(4242), ..RunOptions::default() }, now)
            .await;
        assert!(!missing.is_success());
        assert!(missing.errors[0].contains("4242"));
    }
}

//! Persisted records and the value objects returned across the service boundary.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::errors::AppError;

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = AppError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    other => Err(AppError::InvalidInput(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    Database,
    Files,
    Full,
}

string_enum!(BackupType { Database => "database", Files => "files", Full => "full" });

impl BackupType {
    pub fn includes_database(&self) -> bool {
        matches!(self, BackupType::Database | BackupType::Full)
    }

    pub fn includes_files(&self) -> bool {
        matches!(self, BackupType::Files | BackupType::Full)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Completed,
    Failed,
}

string_enum!(BackupStatus { Completed => "completed", Failed => "failed" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreType {
    Database,
    Files,
}

string_enum!(RestoreType { Database => "database", Files => "files" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStatus {
    Completed,
    Failed,
}

string_enum!(RestoreStatus { Completed => "completed", Failed => "failed" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

string_enum!(Frequency { Daily => "daily", Weekly => "weekly", Monthly => "monthly" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateType {
    Sea,
    Air,
}

string_enum!(RateType { Sea => "sea", Air => "air" });

/// One backup attempt and, when completed, the artifact it produced.
#[derive(Debug, Clone, Serialize)]
pub struct Backup {
    pub id: i64,
    pub name: String,
    pub backup_type: BackupType,
    pub file_path: PathBuf,
    pub file_size: i64,
    pub status: BackupStatus,
    pub checksum: Option<String>,
    pub created_by: Option<i64>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewBackup {
    pub name: String,
    pub backup_type: BackupType,
    pub file_path: PathBuf,
    pub file_size: i64,
    pub status: BackupStatus,
    pub checksum: Option<String>,
    pub created_by: Option<i64>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreLog {
    pub id: i64,
    pub backup_id: Option<i64>,
    pub restored_by: Option<i64>,
    pub restore_type: RestoreType,
    pub status: RestoreStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub pre_restore_backup_path: Option<PathBuf>,
    pub error_message: Option<String>,
    pub metadata: Value,
}

/// A restore log is written once, fully populated, on the exit path of an attempt.
#[derive(Debug, Clone)]
pub struct NewRestoreLog {
    pub backup_id: Option<i64>,
    pub restored_by: Option<i64>,
    pub restore_type: RestoreType,
    pub status: RestoreStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub pre_restore_backup_path: Option<PathBuf>,
    pub error_message: Option<String>,
    pub metadata: Value,
}

/// Read-only projection of a restore log joined with its source backup.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreHistoryEntry {
    pub id: i64,
    pub backup_id: Option<i64>,
    pub backup_name: Option<String>,
    pub restore_type: RestoreType,
    pub status: RestoreStatus,
    pub restored_by: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub pre_restore_backup_path: Option<PathBuf>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupSchedule {
    pub id: i64,
    pub name: String,
    pub backup_type: BackupType,
    pub frequency: Frequency,
    pub time: chrono::NaiveTime,
    pub retention_days: u32,
    pub is_active: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShippingRate {
    pub id: i64,
    pub rate_type: RateType,
    pub min_cubic_feet: Decimal,
    pub max_cubic_feet: Decimal,
    pub price_per_cubic_foot: Decimal,
    pub processing_fee: Decimal,
}

/// Uniform outcome of every public backup/restore operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationResult {
    pub successful: bool,
    pub message: String,
    pub data: Map<String, Value>,
}

pub type BackupResult = OperationResult;
pub type RestoreResult = OperationResult;

impl OperationResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            successful: true,
            message: message.into(),
            data: Map::new(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            successful: false,
            message: message.into(),
            data: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enums_round_trip_through_strings() {
        assert_eq!("FULL".parse::<BackupType>().unwrap(), BackupType::Full);
        assert_eq!(BackupType::Files.to_string(), "files");
        assert_eq!("weekly".parse::<Frequency>().unwrap(), Frequency::Weekly);
        assert!("hourly".parse::<Frequency>().is_err());
    }

    #[test]
    fn test_backup_type_parts() {
        assert!(BackupType::Full.includes_database() && BackupType::Full.includes_files());
        assert!(!BackupType::Database.includes_files());
        assert!(!BackupType::Files.includes_database());
    }

    #[test]
    fn test_operation_result_carries_data() {
        let result = OperationResult::success("done")
            .with("backup_id", 7)
            .with("file_path", "/tmp/x.sql");
        assert!(result.successful);
        assert_eq!(result.get("backup_id"), Some(&Value::from(7)));
        assert_eq!(result.get("missing"), None);
    }
}

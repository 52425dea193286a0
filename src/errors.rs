use std::path::PathBuf;

use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("{tool} exited with status {}: {stderr}", code.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    ToolExecution {
        tool: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("{tool} timed out after {seconds} seconds and was terminated")]
    Timeout { tool: String, seconds: u64 },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Archive {} is corrupt or unreadable: {reason}", path.display())]
    CorruptArchive { path: PathBuf, reason: String },

    #[error(
        "No sea freight rate is configured for {cubic_feet} cubic feet. Please contact support to have a rate added for this volume."
    )]
    RateNotFound { cubic_feet: Decimal },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Rollback failed: {0}")]
    Rollback(String),

    #[error("Another restore is already in progress (lock held at {})", path.display())]
    RestoreInProgress { path: PathBuf },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AppError {
    pub fn corrupt_archive(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        AppError::CorruptArchive {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

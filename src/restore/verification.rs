// freightvault/src/restore/verification.rs
use std::fs::File;
use std::path::Path;

use crate::errors::{AppError, Result};
use crate::models::{Backup, BackupStatus};
use crate::utils::sha256_file;

/// Fails unless `path` is a regular file that can be opened for reading.
pub fn ensure_readable(path: &Path) -> Result<()> {
    let readable = path.is_file() && File::open(path).is_ok();
    if readable {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "Backup file not found or not readable: {}",
            path.display()
        )))
    }
}

/// Verifies a recorded backup before it is restored.
///
/// Only `completed` rows qualify, the artifact must still exist, and its
/// SHA-256 must match the checksum recorded at creation time.
pub fn verify_backup(backup: &Backup) -> Result<()> {
    if backup.status != BackupStatus::Completed {
        return Err(AppError::Validation(format!(
            "Backup {} is not restorable (status {})",
            backup.id, backup.status
        )));
    }
    ensure_readable(&backup.file_path)?;

    let expected = backup.checksum.as_deref().ok_or_else(|| {
        AppError::Validation(format!("Backup {} has no recorded checksum", backup.id))
    })?;
    let actual = sha256_file(&backup.file_path)?;
    if !actual.eq_ignore_ascii_case(expected) {
        tracing::warn!(
            backup_id = backup.id,
            expected,
            actual = %actual,
            "backup checksum mismatch"
        );
        return Err(AppError::Validation(format!(
            "Checksum mismatch for backup {}: the artifact changed since it was created",
            backup.id
        )));
    }
    Ok(())
}

// freightvault/src/restore/lock.rs
use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::errors::{AppError, Result};

/// Exclusive "restore in progress" lock backed by a file created with `create_new`.
///
/// A lock file older than `stale_after` is treated as left over from a crashed
/// process and taken over.
#[derive(Debug)]
pub struct RestoreLock {
    path: PathBuf,
}

impl RestoreLock {
    pub fn acquire(path: &Path, stale_after: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    writeln!(file, "pid={} acquired_at={}", std::process::id(), Utc::now().to_rfc3339())?;
                    tracing::debug!(path = %path.display(), "restore lock acquired");
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if is_stale(path, stale_after) {
                        tracing::warn!(path = %path.display(), "removing stale restore lock");
                        let _ = fs::remove_file(path);
                        continue;
                    }
                    return Err(AppError::RestoreInProgress {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AppError::RestoreInProgress {
            path: path.to_path_buf(),
        })
    }

    pub fn is_held(path: &Path) -> bool {
        path.exists()
    }
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map_or(false, |age| age > stale_after)
}

impl Drop for RestoreLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release restore lock");
        }
    }
}

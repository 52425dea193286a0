//! Maintenance mode as an injected capability.
//!
//! The surrounding application is expected to serve a degraded/read-only
//! response while the flag is set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::Result;

pub trait MaintenanceController: Send + Sync {
    fn enable(&self, reason: &str) -> Result<()>;
    fn disable(&self) -> Result<()>;
    fn is_enabled(&self) -> bool;
}

/// Enables maintenance mode for its lifetime; disabled again on drop.
pub struct MaintenanceGuard<'a> {
    controller: &'a dyn MaintenanceController,
}

impl<'a> MaintenanceGuard<'a> {
    pub fn enable(controller: &'a dyn MaintenanceController, reason: &str) -> Result<Self> {
        controller.enable(reason)?;
        tracing::info!(reason, "maintenance mode enabled");
        Ok(Self { controller })
    }
}

impl Drop for MaintenanceGuard<'_> {
    fn drop(&mut self) {
        match self.controller.disable() {
            Ok(()) => tracing::info!("maintenance mode disabled"),
            Err(e) => tracing::error!(error = %e, "failed to disable maintenance mode"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FlagContents {
    reason: String,
    enabled_at: DateTime<Utc>,
    pid: u32,
}

/// Maintenance flag stored as a small JSON file.
#[derive(Debug, Clone)]
pub struct FileMaintenanceController {
    flag_path: PathBuf,
}

impl FileMaintenanceController {
    pub fn new(flag_path: impl Into<PathBuf>) -> Self {
        Self {
            flag_path: flag_path.into(),
        }
    }

    pub fn flag_path(&self) -> &Path {
        &self.flag_path
    }

    /// Removes a flag left behind by a crashed process. Returns true if one was cleared.
    pub fn clear_stale(&self, max_age: Duration) -> Result<bool> {
        let Ok(raw) = fs::read_to_string(&self.flag_path) else {
            return Ok(false);
        };
        let enabled_at = serde_json::from_str::<FlagContents>(&raw)
            .map(|c| c.enabled_at)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let age = Utc::now().signed_duration_since(enabled_at);
        if age.to_std().map_or(false, |age| age > max_age) {
            tracing::warn!(path = %self.flag_path.display(), "clearing stale maintenance flag");
            self.disable()?;
            return Ok(true);
        }
        Ok(false)
    }
}

impl MaintenanceController for FileMaintenanceController {
    fn enable(&self, reason: &str) -> Result<()> {
        if let Some(parent) = self.flag_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = FlagContents {
            reason: reason.to_string(),
            enabled_at: Utc::now(),
            pid: std::process::id(),
        };
        fs::write(&self.flag_path, serde_json::to_vec_pretty(&contents)?)?;
        Ok(())
    }

    fn disable(&self) -> Result<()> {
        match fs::remove_file(&self.flag_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn is_enabled(&self) -> bool {
        self.flag_path.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingMaintenance;

    #[test]
    fn test_guard_disables_on_drop() {
        let controller = RecordingMaintenance::default();
        {
            let _guard = MaintenanceGuard::enable(&controller, "restore").unwrap();
            assert!(controller.is_enabled());
        }
        assert!(!controller.is_enabled());
        assert_eq!(controller.calls(), vec!["enable", "disable"]);
    }

    #[test]
    fn test_guard_disables_on_early_return() {
        fn fails(controller: &RecordingMaintenance) -> Result<()> {
            let _guard = MaintenanceGuard::enable(controller, "restore")?;
            Err(crate::errors::AppError::Validation("boom".to_string()))
        }
        let controller = RecordingMaintenance::default();
        assert!(fails(&controller).is_err());
        assert!(!controller.is_enabled());
    }

    #[test]
    fn test_file_controller_toggles_flag() {
        let dir = tempfile::tempdir().unwrap();
        let controller = FileMaintenanceController::new(dir.path().join("state/.maintenance"));

        assert!(!controller.is_enabled());
        controller.enable("database restore").unwrap();
        assert!(controller.is_enabled());
        let raw = fs::read_to_string(controller.flag_path()).unwrap();
        assert!(raw.contains("database restore"));

        controller.disable().unwrap();
        assert!(!controller.is_enabled());
        controller.disable().unwrap();
    }

    #[test]
    fn test_stale_flag_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let controller = FileMaintenanceController::new(dir.path().join(".maintenance"));
        let old = FlagContents {
            reason: "crashed restore".to_string(),
            enabled_at: Utc::now() - chrono::Duration::hours(5),
            pid: 1,
        };
        fs::write(controller.flag_path(), serde_json::to_vec(&old).unwrap()).unwrap();

        assert!(!controller.clear_stale(Duration::from_secs(3600 * 6)).unwrap());
        assert!(controller.is_enabled());
        assert!(controller.clear_stale(Duration::from_secs(3600)).unwrap());
        assert!(!controller.is_enabled());
    }
}

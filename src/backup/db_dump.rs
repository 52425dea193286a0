// freightvault/src/backup/db_dump.rs
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::BackupConfig;
use crate::errors::{AppError, Result};
use crate::store::BOOKKEEPING_TABLES;
use crate::utils::process::{CommandSpec, ProcessRunner};
use crate::utils::{find_executable, redact_url};

const HEADER_PROBE_BYTES: usize = 8 * 1024;
const STATEMENT_KEYWORDS: &[&str] = &[
    "SET ", "CREATE ", "INSERT ", "COPY ", "DROP ", "ALTER ", "BEGIN", "SELECT ",
];

/// Produces, validates and replays plain-SQL `pg_dump` files.
pub struct DatabaseBackupHandler {
    config: Arc<BackupConfig>,
    runner: Arc<dyn ProcessRunner>,
}

impl DatabaseBackupHandler {
    pub fn new(config: Arc<BackupConfig>, runner: Arc<dyn ProcessRunner>) -> Self {
        Self { config, runner }
    }

    /// Dumps the live database to `target_path` with `pg_dump`.
    ///
    /// A non-zero exit or an empty output file is a `ToolExecution` failure and
    /// the partial file is removed.
    pub async fn create_dump(&self, target_path: &Path) -> Result<PathBuf> {
        let db_url = self.config.database_url()?;
        let pg_dump = find_executable("pg_dump", self.config.pg_dump_path.as_deref())?;
        if let Some(parent) = target_path.parent() {
            fs::create_dir_all(parent)?;
        }

        tracing::info!(
            database = %redact_url(db_url),
            target = %target_path.display(),
            "dumping database with pg_dump"
        );
        let command = BOOKKEEPING_TABLES
            .iter()
            .fold(
                CommandSpec::new(pg_dump)
                    .arg("--no-owner")
                    .arg("--clean")
                    .arg("--if-exists"),
                |command, table| command.arg(format!("--exclude-table={}", table)),
            )
            .arg("--file")
            .arg(target_path)
            .arg(db_url);

        let outcome = match self.runner.run(&command, self.config.command_timeout).await {
            Ok(output) => output.ensure_success("pg_dump").map(|_| ()),
            Err(e) => Err(e),
        };
        let outcome = outcome.and_then(|_| {
            let size = fs::metadata(target_path).map(|m| m.len()).unwrap_or(0);
            if size == 0 {
                Err(AppError::ToolExecution {
                    tool: "pg_dump".to_string(),
                    code: Some(0),
                    stdout: String::new(),
                    stderr: format!("pg_dump produced no output at {}", target_path.display()),
                })
            } else {
                Ok(())
            }
        });

        if let Err(e) = outcome {
            if target_path.exists() {
                let _ = fs::remove_file(target_path);
            }
            tracing::error!(error = %e, "pg_dump failed");
            return Err(e);
        }

        tracing::info!(target = %target_path.display(), "✓ database dump created");
        Ok(target_path.to_path_buf())
    }

    pub fn validate_dump(&self, path: &Path) -> bool {
        match inspect_dump(path) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "dump failed validation");
                false
            }
        }
    }

    /// Replays a dump into the live database with `psql` in a single transaction.
    pub async fn restore_dump(&self, path: &Path) -> Result<()> {
        if !path.is_file() {
            return Err(AppError::Validation(format!(
                "SQL file for restoration not found: {}",
                path.display()
            )));
        }
        let db_url = self.config.database_url()?;
        let psql = find_executable("psql", self.config.psql_path.as_deref())?;

        tracing::info!(
            database = %redact_url(db_url),
            file = %path.display(),
            "restoring database with psql"
        );
        let command = CommandSpec::new(psql)
            .arg("-X")
            .arg("-q")
            .arg("-v")
            .arg("ON_ERROR_STOP=1")
            .arg("--single-transaction")
            .arg("-d")
            .arg(db_url)
            .arg("-f")
            .arg(path);

        self.runner
            .run(&command, self.config.command_timeout)
            .await?
            .ensure_success("psql")?;

        tracing::info!(file = %path.display(), "✓ database restored from dump");
        Ok(())
    }
}

/// Checks existence, size and that the header looks like SQL.
pub fn inspect_dump(path: &Path) -> Result<()> {
    let meta = fs::metadata(path)
        .map_err(|_| AppError::Validation(format!("Dump file not found: {}", path.display())))?;
    if !meta.is_file() || meta.len() == 0 {
        return Err(AppError::Validation(format!(
            "Dump file is empty or not a regular file: {}",
            path.display()
        )));
    }

    let mut probe = Vec::with_capacity(HEADER_PROBE_BYTES);
    File::open(path)?
        .take(HEADER_PROBE_BYTES as u64)
        .read_to_end(&mut probe)?;
    if probe.contains(&0) {
        return Err(AppError::Validation(format!(
            "Dump file contains binary data: {}",
            path.display()
        )));
    }

    let header = String::from_utf8_lossy(&probe);
    let looks_like_sql = header.contains("PostgreSQL database dump")
        || header.lines().any(|line| {
            let line = line.trim_start().to_ascii_uppercase();
            STATEMENT_KEYWORDS.iter().any(|kw| line.starts_with(kw))
        });
    if !looks_like_sql {
        return Err(AppError::Validation(format!(
            "Dump file has no recognizable SQL header: {}",
            path.display()
        )));
    }
    Ok(())
}

//! External process execution.
//!
//! Dump and restore tools are invoked through [`ProcessRunner`] so the handlers
//! can be exercised without a PostgreSQL installation.

use async_trait::async_trait;
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::errors::{AppError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Value following `flag` in the argument list.
    pub fn arg_after(&self, flag: &str) -> Option<&OsString> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
    }

    /// Short name used in errors and logs, e.g. `pg_dump`.
    pub fn tool_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Converts a non-zero exit into [`AppError::ToolExecution`].
    pub fn ensure_success(self, tool: &str) -> Result<ProcessOutput> {
        if self.success() {
            Ok(self)
        } else {
            Err(AppError::ToolExecution {
                tool: tool.to_string(),
                code: self.code,
                stdout: self.stdout,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, command: &CommandSpec, timeout: Option<Duration>) -> Result<ProcessOutput>;
}

/// Runs commands with `tokio::process`; the child is killed when the timeout elapses.
#[derive(Debug, Default, Clone)]
pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, command: &CommandSpec, timeout: Option<Duration>) -> Result<ProcessOutput> {
        let tool = command.tool_name();
        tracing::debug!(%tool, args = ?command.args.len(), "spawning external tool");

        let child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::ToolExecution {
                tool: tool.clone(),
                code: None,
                stdout: String::new(),
                stderr: format!("failed to start {}: {}", command.program.display(), e),
            })?;

        let output = match timeout {
            // Dropping the future drops the child, and kill_on_drop terminates it.
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| {
                    tracing::warn!(%tool, seconds = limit.as_secs(), "external tool timed out, killed");
                    AppError::Timeout {
                        tool: tool.clone(),
                        seconds: limit.as_secs(),
                    }
                })??,
            None => child.wait_with_output().await?,
        };

        Ok(ProcessOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

//! Command execution.
//!
//! The queue treats a job's command as opaque; a [`CommandExecutor`] decides
//! what running it means. [`ShellExecutor`] hands it to `sh -c`.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

/// Captured result of a command that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Text recorded on the job when the command did not succeed.
    pub fn failure_reason(&self) -> String {
        if !self.stderr.is_empty() {
            return self.stderr.clone();
        }
        match self.exit_code {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        }
    }
}

/// The command could not produce an [`ExecOutput`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecError {
    #[error("timeout after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("execution error: {0}")]
    Execution(String),
}

/// Runs a job command.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &str, timeout: Option<Duration>)
    -> Result<ExecOutput, ExecError>;
}

/// Runs commands through `sh -c`, capturing trimmed stdout/stderr.
///
/// On timeout the child is killed before the error is returned.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different POSIX shell binary (must accept `-c`).
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, ExecError> {
        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::Execution(e.to_string()))?;

        // Dropping the wait future drops the child, which kills it.
        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| ExecError::Timeout(limit))?,
            None => child.wait_with_output().await,
        }
        .map_err(|e| ExecError::Execution(e.to_string()))?;

        Ok(ExecOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

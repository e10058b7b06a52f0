//! Host control: kernel modules and service units
//!
//! Thin wrappers around `lsmod`/`modprobe`/`rmmod` and `systemctl`. Every
//! invocation reports the exit status and captured output; interpreting a
//! non-zero exit is left to the caller. A command that does not finish within
//! the configured timeout is killed and reported as a failed request.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::CommandsConfig;
use crate::error::{AppError, Result};

/// Outcome of an external command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if terminated by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful exit with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed exit with the given stderr
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Error text suitable for reporting a failure
    pub fn error_text(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        match self.status {
            Some(code) => format!("exited with status {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Kernel module and service unit control
#[async_trait]
pub trait HostControl: Send + Sync {
    /// Names of the currently loaded kernel modules
    async fn loaded_modules(&self) -> Result<Vec<String>>;

    async fn load_module(&self, name: &str) -> Result<CommandOutput>;

    async fn unload_module(&self, name: &str) -> Result<CommandOutput>;

    async fn start_unit(&self, unit: &str) -> Result<CommandOutput>;

    async fn stop_unit(&self, unit: &str) -> Result<CommandOutput>;
}

/// Host control through the usual system binaries
pub struct SystemHost {
    commands: CommandsConfig,
}

impl SystemHost {
    pub fn new(commands: CommandsConfig) -> Self {
        Self { commands }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        debug!("Running {} {}", program, args.join(" "));

        let limit = self.commands.timeout();
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(limit, child)
            .await
            .map_err(|_| {
                warn!("{} did not finish within {:?}, killed", program, limit);
                AppError::FailedRequest(format!(
                    "{} {} did not finish within {:?}",
                    program,
                    args.join(" "),
                    limit
                ))
            })?
            .map_err(|e| AppError::FailedRequest(format!("Failed to run {}: {}", program, e)))?;

        let result = CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!("{} exited with {:?}", program, result.status);
        Ok(result)
    }
}

#[async_trait]
impl HostControl for SystemHost {
    async fn loaded_modules(&self) -> Result<Vec<String>> {
        let output = self.run(&self.commands.lsmod, &[]).await?;
        if !output.success() {
            return Err(AppError::FailedRequest(output.error_text()));
        }
        Ok(parse_lsmod(&output.stdout))
    }

    async fn load_module(&self, name: &str) -> Result<CommandOutput> {
        self.run(&self.commands.modprobe, &[name]).await
    }

    async fn unload_module(&self, name: &str) -> Result<CommandOutput> {
        self.run(&self.commands.rmmod, &[name]).await
    }

    async fn start_unit(&self, unit: &str) -> Result<CommandOutput> {
        self.run(&self.commands.systemctl, &["start", unit]).await
    }

    async fn stop_unit(&self, unit: &str) -> Result<CommandOutput> {
        self.run(&self.commands.systemctl, &["stop", unit]).await
    }
}

/// Extract module names from `lsmod` output
pub fn parse_lsmod(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|name| *name != "Module")
        .map(str::to_string)
        .collect()
}

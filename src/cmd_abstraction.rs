//! Command execution abstraction for testability.
//!
//! Every firewall tool invocation goes through [`CommandRunner`], so unit tests
//! can script the tool's output without running anything, and so every call
//! carries its own timeout.

use async_trait::async_trait;
use std::io::ErrorKind as IoErrorKind;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

#[cfg(test)]
use mockall::automock;

/// Output from command execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output from the command
    pub stdout: String,
    /// Standard error from the command
    pub stderr: String,
    /// Whether the command succeeded (exit code 0)
    pub success: bool,
    /// The exit code, if available
    pub code: Option<i32>,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            success: true,
            code: Some(0),
        }
    }

    /// Failed output with the given stderr and exit code 1
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            success: false,
            code: Some(1),
        }
    }

    /// Whatever the tool printed, stderr first, trimmed
    pub fn message(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Failure to get any output from a command.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("command '{0}' not found")]
    NotFound(String),

    #[error("permission denied executing '{0}'")]
    PermissionDenied(String),

    #[error("command '{program}' timed out after {}s", .timeout.as_secs())]
    Timeout { program: String, timeout: Duration },

    #[error("failed to execute '{program}': {message}")]
    Io { program: String, message: String },
}

/// Trait for command execution, allowing dependency injection for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, giving up after `timeout`.
    ///
    /// A non-zero exit is not an error: it comes back as an output with
    /// `success == false`.
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError>;
}

/// Runs real processes through tokio.
#[derive(Debug, Clone, Default)]
pub struct SystemCommandRunner;

impl SystemCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The child is killed if the timeout drops the future
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(timeout, child).await {
            Err(_) => {
                return Err(CommandError::Timeout {
                    program: program.to_string(),
                    timeout,
                })
            }
            Ok(Err(e)) => {
                return Err(match e.kind() {
                    IoErrorKind::NotFound => CommandError::NotFound(program.to_string()),
                    IoErrorKind::PermissionDenied => {
                        CommandError::PermissionDenied(program.to_string())
                    }
                    _ => CommandError::Io {
                        program: program.to_string(),
                        message: e.to_string(),
                    },
                })
            }
            Ok(Ok(output)) => output,
        };

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
            code: output.status.code(),
        })
    }
}

/// Helper function to convert a slice of &str to Vec<String>.
///
/// mockall has issues with lifetimes in `&[&str]`, so the trait takes `&[String]`.
pub fn args_to_strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

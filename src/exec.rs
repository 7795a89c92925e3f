//! Shell command execution
//!
//! Every interaction with the container runtime goes through a [`ShellExecutor`].
//! The production implementation runs `sh -c <command line>`; tests substitute
//! scripted executors.

use futures::future::BoxFuture;
use hyper::body::Bytes;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Captured result of a finished command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    /// Raw stdout, never decoded
    pub stdout: Bytes,
    /// Raw stderr
    pub stderr: Bytes,
}

impl CommandOutput {
    /// Build a successful output with the given stdout
    pub fn ok(stdout: impl Into<Bytes>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: Bytes::new(),
        }
    }

    /// Build a failed output with the given exit code and stderr
    pub fn failed(exit_code: i32, stderr: impl Into<Bytes>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: Bytes::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stderr as trimmed text, or a description of the exit status when empty
    pub fn diagnostic(&self) -> String {
        let stderr = String::from_utf8_lossy(&self.stderr);
        let stderr = stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        match self.exit_code {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Errors from running a command
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn shell: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("command timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
}

/// Runs shell command lines.
///
/// Implementations must be cancel-safe: dropping the returned future must not
/// leave the command running.
pub trait ShellExecutor: Send + Sync {
    fn run<'a>(
        &'a self,
        command_line: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<CommandOutput, ExecError>>;
}

/// Executes command lines with the system `sh`
#[derive(Debug, Clone)]
pub struct SystemShell {
    shell: String,
}

impl SystemShell {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }

    /// Use a specific shell binary (must accept `-c <line>`)
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for SystemShell {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellExecutor for SystemShell {
    fn run<'a>(
        &'a self,
        command_line: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<CommandOutput, ExecError>> {
        Box::pin(async move {
            debug!(command = command_line, "Running shell command");

            let mut cmd = Command::new(&self.shell);
            cmd.arg("-c")
                .arg(command_line)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let child = cmd.spawn()?;

            // On timeout the wait future is dropped, which drops the child and kills it
            match tokio::time::timeout(timeout, child.wait_with_output()).await {
                Ok(output) => {
                    let output = output?;
                    Ok(CommandOutput {
                        exit_code: output.status.code(),
                        stdout: Bytes::from(output.stdout),
                        stderr: Bytes::from(output.stderr),
                    })
                }
                Err(_) => Err(ExecError::TimedOut(timeout)),
            }
        })
    }
}

/// Join program and arguments into one shell-safe command line
pub fn command_line<I, S>(words: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    shell_words::join(words)
}

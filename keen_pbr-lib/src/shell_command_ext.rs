use thiserror::Error;
use tokio::process::Command;

use std::future::Future;
use std::io;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Command execution failed")]
    CommandFailed,
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

/// Whether command failures should reach the log. Cleanup paths that expect
/// failures suppress them.
#[derive(Debug, Clone, Copy)]
pub enum Logs {
    Print,
    Suppress,
}

pub trait ShellCommandExt {
    fn run(&mut self, logs: Logs) -> impl Future<Output = Result<(), Error>> + Send;
    fn run_status(&mut self) -> impl Future<Output = Result<bool, Error>> + Send;
}

impl ShellCommandExt for Command {
    /// Run the command and fail on a non-zero exit. stdout and stderr are
    /// always captured; stderr noise from a successful run is only worth a
    /// warning since `ipset` grumbles on some harmless operations.
    async fn run(&mut self, logs: Logs) -> Result<(), Error> {
        let output = self.output().await?;
        let stderr = String::from_utf8_lossy(&output.stderr);

        if output.status.success() {
            if !stderr.is_empty() && matches!(logs, Logs::Print) {
                tracing::warn!(cmd = ?self, %stderr, "successful command wrote to stderr");
            }
            return Ok(());
        }

        if matches!(logs, Logs::Print) {
            let stdout = String::from_utf8_lossy(&output.stdout);
            tracing::error!(cmd = ?self, status_code = ?output.status.code(), %stdout, %stderr, "command failed");
        }
        Err(Error::CommandFailed)
    }

    /// Run the command and report whether it exited successfully. Used for
    /// probes like `ipset list -name` and `ipset test` where a non-zero exit
    /// is an answer, not an error.
    async fn run_status(&mut self) -> Result<bool, Error> {
        let output = self.output().await?;
        Ok(output.status.success())
    }
}

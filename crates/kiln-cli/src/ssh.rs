//! Communicator backed by the system `ssh` client.

use async_trait::async_trait;
use kiln_core::{BuildError, Communicator, Result};
use kiln_prism::cancellable_sleep;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How long `connect` keeps retrying before giving up.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Delay between connection attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Runs guest commands through `ssh user@host command`.
#[derive(Debug, Clone)]
pub struct SshCommunicator {
    user: String,
    key: Option<PathBuf>,
    program: String,
    connect_timeout: Duration,
    retry_interval: Duration,
}

impl SshCommunicator {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            key: None,
            program: "ssh".into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    /// Private key passed with `-i`.
    pub fn with_key(mut self, key: Option<PathBuf>) -> Self {
        self.key = key;
        self
    }

    /// Client binary to invoke instead of `ssh`.
    #[cfg(test)]
    fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    #[cfg(test)]
    fn with_connect_timeout(mut self, timeout: Duration, retry_interval: Duration) -> Self {
        self.connect_timeout = timeout;
        self.retry_interval = retry_interval;
        self
    }

    fn command(&self, host: &str, remote: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("UserKnownHostsFile=/dev/null")
            .arg("-o")
            .arg("ConnectTimeout=10");
        if let Some(key) = &self.key {
            cmd.arg("-i").arg(key);
        }
        cmd.arg(format!("{}@{host}", self.user))
            .arg(remote)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run `remote` on `host` and return its exit code (-1 if killed by a signal).
    async fn exec(&self, host: &str, remote: &str, cancel: &CancellationToken) -> Result<i32> {
        let child = self
            .command(host, remote)
            .spawn()
            .map_err(|e| BuildError::Communicator(format!("failed to spawn {}: {e}", self.program)))?;

        // Dropping the child on cancellation kills the process.
        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BuildError::Cancelled),
            output = child.wait_with_output() => output?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stdout.lines() {
            tracing::debug!(host, "{line}");
        }
        for line in stderr.lines() {
            tracing::debug!(host, stream = "stderr", "{line}");
        }
        Ok(output.status.code().unwrap_or(-1))
    }
}

#[async_trait]
impl Communicator for SshCommunicator {
    async fn connect(&self, host: &str, cancel: &CancellationToken) -> Result<()> {
        let deadline = Instant::now() + self.connect_timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let status = self.exec(host, "true", cancel).await?;
            if status == 0 {
                tracing::info!(host, user = %self.user, attempts, "SSH connected");
                return Ok(());
            }
            tracing::debug!(host, status, attempts, "SSH not ready");

            if Instant::now() >= deadline {
                return Err(BuildError::Communicator(format!(
                    "timed out after {:?} waiting for ssh on {host}",
                    self.connect_timeout
                )));
            }
            cancellable_sleep(cancel, self.retry_interval).await?;
        }
    }

    async fn run_command(&self, host: &str, command: &str, cancel: &CancellationToken) -> Result<i32> {
        tracing::info!(host, command, "Running remote command");
        let status = self.exec(host, command, cancel).await?;
        tracing::debug!(host, status, "Remote command finished");
        Ok(status)
    }
}

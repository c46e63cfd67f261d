//! Contracts for the collaborators a build talks to.
//!
//! The orchestrator only needs narrow interfaces to the user-facing sink,
//! the remote command channel and the VM console. Concrete transports live
//! in the binary.

use crate::bootcmd::BootKey;
use crate::config::BuildConfig;
use crate::error::Result;
use crate::state::BuildState;
use async_trait::async_trait;
use kiln_prism::ConsoleAccess;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::sync::CancellationToken;

/// Reader handed through the UI for progress reporting.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Host used when no guest address was acquired.
pub const LOCAL_HOST: &str = "127.0.0.1";

// ============================================================================
// User interface
// ============================================================================

/// User-facing output sink.
pub trait Ui: Send + Sync {
    /// Announce a build milestone.
    fn say(&self, msg: &str);
    /// Secondary detail under the last milestone.
    fn message(&self, msg: &str);
    fn error(&self, msg: &str);
    /// Wrap `reader` so transferred bytes are reported under `label`.
    fn track_progress(&self, label: &str, total: Option<u64>, reader: BoxReader) -> BoxReader;
}

/// [`Ui`] that writes everything to tracing.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingUi;

impl Ui for TracingUi {
    fn say(&self, msg: &str) {
        tracing::info!("==> {msg}");
    }

    fn message(&self, msg: &str) {
        tracing::info!("    {msg}");
    }

    fn error(&self, msg: &str) {
        tracing::error!("{msg}");
    }

    fn track_progress(&self, label: &str, total: Option<u64>, reader: BoxReader) -> BoxReader {
        Box::new(ProgressReader::new(label, total, reader))
    }
}

/// Bytes between two progress log lines.
const PROGRESS_STEP: u64 = 64 * 1024 * 1024;

/// Reader that logs how much of a transfer went through.
pub struct ProgressReader {
    label: String,
    total: Option<u64>,
    inner: BoxReader,
    read: u64,
    next_report: u64,
    done: bool,
}

impl ProgressReader {
    pub fn new(label: impl Into<String>, total: Option<u64>, inner: BoxReader) -> Self {
        Self {
            label: label.into(),
            total,
            inner,
            read: 0,
            next_report: PROGRESS_STEP,
            done: false,
        }
    }

    /// Bytes read so far.
    pub fn bytes_read(&self) -> u64 {
        self.read
    }
}

impl AsyncRead for ProgressReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = (buf.filled().len() - before) as u64;
                this.read += n;
                if n == 0 && !this.done {
                    this.done = true;
                    tracing::info!(label = %this.label, bytes = this.read, "Transfer finished");
                } else if this.read >= this.next_report {
                    this.next_report = this.read + PROGRESS_STEP;
                    tracing::info!(
                        label = %this.label,
                        bytes = this.read,
                        total = ?this.total,
                        "Transfer progress"
                    );
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

// ============================================================================
// Remote commands
// ============================================================================

/// Remote command channel to the guest.
#[async_trait]
pub trait Communicator: Send + Sync {
    /// Wait until the guest at `host` accepts commands.
    async fn connect(&self, host: &str, cancel: &CancellationToken) -> Result<()>;

    /// Run `command` on `host` and return its exit status.
    async fn run_command(&self, host: &str, command: &str, cancel: &CancellationToken) -> Result<i32>;
}

/// Address the communicator should target: the configured `ssh_host`, then
/// the acquired IP, then loopback.
pub fn connection_host<'a>(config: &'a BuildConfig, state: &'a BuildState) -> &'a str {
    config
        .ssh_host
        .as_deref()
        .map(str::trim)
        .filter(|host| !host.is_empty())
        .or(state.ip.as_deref())
        .unwrap_or(LOCAL_HOST)
}

// ============================================================================
// Console
// ============================================================================

/// Opens remote console sessions from generated access tokens.
#[async_trait]
pub trait ConsoleTransport: Send + Sync {
    async fn connect(
        &self,
        access: &ConsoleAccess,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn ConsoleSession>>;
}

/// An open console accepting keystrokes.
#[async_trait]
pub trait ConsoleSession: Send + Sync {
    /// Press and release one key.
    async fn send_key(&mut self, key: BootKey) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_progress_reader_counts_bytes() {
        let data = vec![7u8; 1000];
        let mut reader = ProgressReader::new("disk", Some(1000), Box::new(std::io::Cursor::new(data)));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out.len(), 1000);
        assert_eq!(reader.bytes_read(), 1000);
    }

    #[test]
    fn test_connection_host_falls_back_to_loopback() {
        let config = BuildConfig::default();
        let mut state = BuildState::default();
        assert_eq!(connection_host(&config, &state), "127.0.0.1");
        state.ip = Some("10.0.0.5".into());
        assert_eq!(connection_host(&config, &state), "10.0.0.5");
    }

    #[test]
    fn test_explicit_ssh_host_wins() {
        let mut config = BuildConfig {
            ssh_host: Some("bastion.example.com".into()),
            ..Default::default()
        };
        let state = BuildState {
            ip: Some("10.0.0.5".into()),
            ..Default::default()
        };
        assert_eq!(connection_host(&config, &state), "bastion.example.com");

        config.ssh_host = Some("  ".into());
        assert_eq!(connection_host(&config, &state), "10.0.0.5");
    }
}

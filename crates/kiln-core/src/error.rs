//! Error types for kiln-core.

use kiln_prism::PrismError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for kiln-core operations.
pub type Result<T> = std::result::Result<T, BuildError>;

/// Errors that halt a build.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Error from the resource driver
    #[error(transparent)]
    Prism(#[from] PrismError),

    /// The VM has no data disk to capture
    #[error("no disk was found to save")]
    NoDisksToSave,

    /// A downloaded artifact does not have the expected size
    #[error("size mismatch for {}: expected {expected} bytes, got {actual}", .path.display())]
    SizeMismatch {
        /// Partial file (already removed)
        path: PathBuf,
        /// Size reported for the source
        expected: u64,
        /// Bytes written
        actual: u64,
    },

    /// A download was stopped by cancellation
    #[error("transfer to {} interrupted", .0.display())]
    TransferInterrupted(PathBuf),

    /// The VM did not reach OFF in time
    #[error("timed out after {0:?} waiting for the VM to shut down")]
    ShutdownTimeout(Duration),

    /// Remote command execution failed
    #[error("communicator error: {0}")]
    Communicator(String),

    /// Console connection or keystroke injection failed
    #[error("console error: {0}")]
    Console(String),

    /// A step ran before the step producing its input
    #[error("build state has no {0}")]
    MissingState(&'static str),

    /// Build description is inconsistent
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The build was cancelled
    #[error("build cancelled")]
    Cancelled,
}

impl BuildError {
    /// Whether this error is the result of cancellation rather than a fault.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled | Self::TransferInterrupted(_) => true,
            Self::Prism(e) => e.is_cancelled(),
            _ => false,
        }
    }
}

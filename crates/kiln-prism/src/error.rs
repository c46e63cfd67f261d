//! Error types for kiln-prism.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for kiln-prism operations.
pub type Result<T> = std::result::Result<T, PrismError>;

/// Kind of named resource a lookup was performed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Cluster,
    Subnet,
    Project,
    Gpu,
    Host,
    Category,
    Image,
    Vm,
    Ova,
    Task,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cluster => "cluster",
            Self::Subnet => "subnet",
            Self::Project => "project",
            Self::Gpu => "gpu",
            Self::Host => "host",
            Self::Category => "category",
            Self::Image => "image",
            Self::Vm => "vm",
            Self::Ova => "ova",
            Self::Task => "task",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while talking to Prism Central.
#[derive(Debug, Error)]
pub enum PrismError {
    /// Lookup by name or id found nothing
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// Kind of resource
        kind: ResourceKind,
        /// Name or id that was looked up
        name: String,
    },

    /// Lookup by name matched more than one resource
    #[error("found {count} {kind}s matching '{name}', use {hint} instead")]
    Ambiguous {
        /// Kind of resource
        kind: ResourceKind,
        /// Name that was looked up
        name: String,
        /// Number of surviving matches
        count: usize,
        /// Configuration field that disambiguates
        hint: &'static str,
    },

    /// An async task reached the FAILED state
    #[error("task {task} failed: {detail}")]
    TaskFailed {
        /// Task id
        task: String,
        /// Verbatim provider error text
        detail: String,
    },

    /// An async task did not reach a terminal state in time
    #[error("task {task} did not complete within {budget:?}")]
    TaskTimeout {
        /// Task id
        task: String,
        /// Configured budget
        budget: Duration,
    },

    /// No IP address was ever observed before the wait timed out
    #[error("timed out after {0:?} waiting for an IP address")]
    IpTimeout(Duration),

    /// The operation was interrupted by the cancellation token
    #[error("operation cancelled")]
    Cancelled,

    /// An image with the target name already exists
    #[error("image '{name}' already exists ({count} match(es))")]
    ImageExists {
        /// Target image name
        name: String,
        /// Number of existing images with that name
        count: usize,
    },

    /// Request-level configuration is inconsistent
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Non-success HTTP status from the API
    #[error("API error {status}: {body}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// Response did not carry an expected field
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PrismError {
    pub(crate) fn not_found(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Whether this error is the result of cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

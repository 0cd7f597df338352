//! Gateway error hierarchy.
//!
//! Errors are grouped by operational concern. Only the `Fatal` and `Config`
//! classes terminate the process (missing namespace, failed client
//! construction, listener failure); everything else is logged at the point
//! of failure and the affected operation degrades (empty list, skipped
//! event, dropped client).

use config::ConfigError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration loading or validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Failures talking to the orchestrator API
    #[error(transparent)]
    Platform(#[from] PlatformError),

    /// HTTP listener / serving failures
    #[error("HTTP server error: {0}")]
    Http(#[from] std::io::Error),

    /// Unrecoverable failures requiring process termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

/// Errors surfaced by the orchestrator boundary.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    /// The requested object does not exist (expected for deleted pods)
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    /// API request failed with a non-success status
    #[error("API request to {path} failed with status {status}")]
    ApiStatus { path: String, status: u16 },

    /// Transport-level request failure
    #[error("API request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Response payload did not have the expected shape
    #[error("Malformed API response: {0}")]
    Decode(#[from] serde_json::Error),

    /// In-cluster credentials missing or unreadable
    #[error("In-cluster configuration unavailable: {0}")]
    Credentials(String),
}

impl PlatformError {
    /// True when the error means the object is simply gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, PlatformError::NotFound { .. })
    }
}

//! Error types for VibeVault.

use thiserror::Error;

/// Result type alias using VibeVault's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for VibeVault operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Link not found
    #[error("Link not found: {0}")]
    LinkNotFound(uuid::Uuid),

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(uuid::Uuid),

    /// Unique constraint violated (e.g. same normalized URL saved twice)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Page fetch failed
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Message queue operation failed
    #[error("Queue error: {0}")]
    Queue(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Failure to retrieve a page.
///
/// Network failures, timeouts, and non-2xx responses are all reported through
/// this one type. The fetcher never retries; the runner's retry policy decides.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// URL could not be parsed or uses an unsupported scheme.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// Request did not complete within the configured timeout.
    #[error("request timed out after {0}s")]
    Timeout(u64),

    /// Connection, DNS, TLS or redirect failure.
    #[error("network error: {0}")]
    Network(String),

    /// Server answered with a non-2xx status.
    #[error("HTTP status {0}")]
    Status(u16),

    /// Response body could not be read.
    #[error("failed to read body: {0}")]
    Body(String),
}

impl FetchError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::InvalidUrl(_))
    }
}

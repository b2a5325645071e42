//! Error types for the script agent

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the crate
///
/// The variants line up with the failure domains the agent loop has to tell
/// apart: missing credentials (`Config`), a failed call (`Http`, `Api`,
/// `Stream`, `Transport`, `Timeout`), and a user abort (`Cancelled`).
/// Script failures are not errors here; they travel back to the model as
/// ordinary text.
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error on a pipe or file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or missing configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Error reported by the model service (non-2xx or an `error` payload)
    #[error("API error: {0}")]
    Api(String),

    /// Streaming error (truncated stream, stream ended without a message)
    #[error("Streaming error: {0}")]
    Stream(String),

    /// Subprocess transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Timed out waiting for a response
    #[error("Request timeout")]
    Timeout,

    /// The operation was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Other errors
    #[error("Error: {0}")]
    Other(String),
}

impl Error {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new API error
    pub fn api(msg: impl Into<String>) -> Self {
        Error::Api(msg.into())
    }

    /// Create a new stream error
    pub fn stream(msg: impl Into<String>) -> Self {
        Error::Stream(msg.into())
    }

    /// Create a new transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    /// Create a new other error
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Create a timeout error
    pub fn timeout() -> Self {
        Error::Timeout
    }

    /// Create a cancellation error
    pub fn cancelled() -> Self {
        Error::Cancelled
    }

    /// True if this error represents a caller-requested abort
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

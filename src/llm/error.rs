//! Backend-specific error types
//!
//! Errors that can occur while calling a language-model backend.

use thiserror::Error;

/// Errors that can occur during a backend call
///
/// Every variant maps to the "request failed" outcome; cancellation is never
/// expressed as a `BackendError`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    /// The backend could not be reached (DNS, connect, broken body stream)
    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    /// The backend answered with a non-success HTTP status
    #[error("Backend returned error status {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body, for diagnostics
        body: String,
    },

    /// The response body could not be decoded or carried no usable text
    #[error("Malformed backend response: {0}")]
    Malformed(String),

    /// Connecting or reading exceeded the configured timeout
    #[error("Backend call timed out after {0} seconds")]
    Timeout(u64),

    /// The backend client is missing required settings
    #[error("Backend configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BackendError::Unreachable(format!("timed out: {}", e))
        } else if e.is_decode() {
            BackendError::Malformed(e.to_string())
        } else {
            BackendError::Unreachable(e.to_string())
        }
    }
}

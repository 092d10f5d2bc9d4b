//! Error types for the dialogue bridge
//!
//! `BridgeError` is the session-level taxonomy. Each layer keeps its own error
//! enum (`BackendError`, `AgentError`, `TranscriptError`) and converts into this
//! one at the session boundary.

use crate::agent::AgentError;
use crate::llm::BackendError;
use crate::transcript::TranscriptError;
use thiserror::Error;

/// Session-level error types
///
/// `Connection`, `Protocol` and `Agent` are fatal to a session and trigger its
/// shutdown. `RequestFailed` is recovered locally with a spoken apology, and
/// `Cancelled` is an expected interruption with no user-visible effect.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The speech agent or the model backend cannot be reached
    #[error("Connection error: {0}")]
    Connection(String),

    /// The backend answered with an error status or an unusable payload
    #[error("Request failed: {0}")]
    RequestFailed(#[from] BackendError),

    /// The request was cancelled before it completed
    #[error("Request cancelled")]
    Cancelled,

    /// A streamed event could not be decoded; the stream framing is no longer trusted
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A command could not be delivered to the speech agent
    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    /// Configuration is invalid
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The conversation log could not be written
    #[error("Transcript error: {0}")]
    Transcript(#[from] TranscriptError),
}

impl BridgeError {
    /// Whether this error ends the session
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::Connection(_) | BridgeError::Protocol(_) | BridgeError::Agent(_)
        )
    }
}

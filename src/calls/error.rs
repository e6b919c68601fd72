//! Call-related error types.

use thiserror::Error;

use super::types::{ConversationId, NegotiationFailure};

#[derive(Debug, Error)]
pub enum CallError {
    #[error("a call is already in progress for conversation {0}")]
    AlreadyInCall(ConversationId),

    #[error("no call for conversation {0}")]
    NotFound(ConversationId),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("local media unavailable: {0}")]
    MediaUnavailable(String),

    #[error("incompatible session description: {0}")]
    IncompatibleDescription(String),

    #[error("call was not answered in time")]
    Timeout,

    #[error("negotiation timed out")]
    NegotiationTimeout,

    #[error("connection lost")]
    ConnectionLost,

    #[error("call session has already ended")]
    SessionClosed,

    #[error("signaling transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("media engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("malformed signaling payload: {0}")]
    Parse(String),
}

impl From<serde_json::Error> for CallError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// The signaling channel is not connected; sends are best-effort and dropped.
    #[error("signaling transport unavailable")]
    Unavailable,

    #[error("failed to connect to relay: {0}")]
    Connect(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("connect timed out")]
    ConnectTimeout,
}

/// Failures reported by a [`MediaNegotiationEngine`](super::engine::MediaNegotiationEngine).
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("media unavailable: {0}")]
    MediaUnavailable(String),

    #[error("incompatible description: {0}")]
    IncompatibleDescription(String),

    #[error("engine closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Classify a failed negotiation step for the session's end reason.
    pub fn into_failure(self) -> NegotiationFailure {
        match self {
            Self::MediaUnavailable(msg) => NegotiationFailure::MediaUnavailable(msg),
            Self::IncompatibleDescription(msg) => NegotiationFailure::IncompatibleDescription(msg),
            Self::Closed => NegotiationFailure::DescriptionFailed("engine closed".into()),
            Self::Other(msg) => NegotiationFailure::DescriptionFailed(msg),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

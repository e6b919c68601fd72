//! Capability interface to the media/connection engine.
//!
//! The engine (codec negotiation, ICE, capture) lives outside this crate. The
//! controller drives it through [`MediaNegotiationEngine`] and observes it
//! through the [`EngineEvent`] stream returned by [`EngineFactory::create`].

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::error::EngineError;
use super::types::{
    ConversationId, DescriptionKind, IceCandidate, MediaConstraints, MediaTrack,
    SessionDescription,
};

/// Connection state transitions reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Push-style notifications from the engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A locally gathered ICE candidate to be sent to the peer.
    LocalCandidate(IceCandidate),
    ConnectionStateChanged(ConnectionState),
    RemoteTrack(MediaTrack),
}

/// One engine instance per call session, destroyed with it.
#[async_trait]
pub trait MediaNegotiationEngine: Send + Sync {
    /// Start local capture and attach the tracks to the connection.
    async fn attach_local_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Vec<MediaTrack>, EngineError>;

    /// Produce a local offer or answer.
    async fn create_local_description(
        &self,
        kind: DescriptionKind,
    ) -> Result<SessionDescription, EngineError>;

    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError>;

    /// Silently ineffective if called before a remote description is applied.
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;

    fn set_local_audio_enabled(&self, enabled: bool);

    fn set_local_video_enabled(&self, enabled: bool);

    async fn switch_camera(&self) -> Result<(), EngineError>;

    /// Release all native resources. Idempotent.
    async fn close(&self);
}

/// Constructs a fresh engine for a session.
pub trait EngineFactory: Send + Sync {
    fn create(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<(Arc<dyn MediaNegotiationEngine>, mpsc::Receiver<EngineEvent>), EngineError>;
}

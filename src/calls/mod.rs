//! Real-time call signaling.
//!
//! Drives one call attempt per conversation from offer to teardown and moves
//! offers, answers and ICE candidates between the two parties through a
//! shared relay connection.
//!
//! # Architecture
//!
//! - [`SignalingTransport`]: the process-wide relay connection ([`WebSocketTransport`])
//! - [`SignalingRouter`]: maps relay events to sessions and owns room membership
//! - [`CallSessionController`]: per-session actor owning the [`CallSession`] state machine
//! - [`CallHandle`]: intent surface handed to the presentation layer
//! - [`MediaNegotiationEngine`]: capability interface to the external media engine
//!
//! # Protocol Overview
//!
//! A caller sends `call-user` to the conversation room. The callee answers
//! with `answer-made` directed at the caller's address, and both sides trade
//! `ice-candidate` messages until the engine reports connected. Either side
//! ends with `end-call`; a callee refuses with `decline-call`.

mod config;
mod controller;
mod engine;
mod error;
mod router;
mod signaling;
mod state;
mod transport;
mod types;

#[cfg(test)]
mod test_utils;

pub use config::{CallConfig, RelayConfig};
pub use controller::{CallHandle, CallSessionController};
pub use engine::{ConnectionState, EngineEvent, EngineFactory, MediaNegotiationEngine};
pub use error::{CallError, EngineError, InvalidTransition, TransportError};
pub use router::{CallEvent, SessionRegistry, SignalingRouter};
pub use signaling::{InboundSignal, SignalingEvent, SignalingMessage};
pub use state::{CallSession, CallState, CallTransition, SessionSnapshot};
pub use transport::{SignalingTransport, TransportEvent, WebSocketTransport};
pub use types::{
    CallRole, ConversationId, DescriptionKind, EndReason, IceCandidate, MediaConstraints,
    MediaTrack, NegotiationFailure, PeerAddress, SessionDescription, SessionId, TrackKind,
};

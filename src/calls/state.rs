//! Call state machine implementation.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

use super::error::{CallError, EngineError, InvalidTransition};
use super::types::{
    CallRole, ConversationId, EndReason, IceCandidate, MediaTrack, NegotiationFailure, PeerAddress,
    SessionDescription, SessionId,
};

/// Current state of a call session. `Idle` is the absence of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CallState {
    /// Caller: preparing or sent the offer, waiting for an answer.
    Outgoing {
        started_at: DateTime<Utc>,
        offer_sent_at: Option<DateTime<Utc>>,
    },
    /// Callee: ringing locally.
    Incoming { received_at: DateTime<Utc> },
    /// Descriptions exchanged (or being exchanged), waiting for the engine to connect.
    Negotiating {
        role: CallRole,
        since: DateTime<Utc>,
    },
    /// Media connected.
    Active { connected_at: DateTime<Utc> },
    /// Terminal.
    Ended {
        reason: EndReason,
        ended_at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
}

impl CallState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Incoming { .. })
    }

    pub fn is_negotiating(&self) -> bool {
        matches!(self, Self::Negotiating { .. })
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }

    pub fn can_accept(&self) -> bool {
        matches!(self, Self::Incoming { .. })
    }

    pub fn end_reason(&self) -> Option<&EndReason> {
        match self {
            Self::Ended { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// Short human-readable status for the call screen.
    pub fn status_text(&self) -> &'static str {
        match self {
            Self::Outgoing { .. } => "Calling…",
            Self::Incoming { .. } => "Incoming call",
            Self::Negotiating { .. } => "Connecting…",
            Self::Active { .. } => "Connected",
            Self::Ended { reason, .. } => match reason {
                EndReason::Declined => "Call declined",
                EndReason::Timeout => "No answer",
                r if r.is_failure() => "Call failed",
                _ => "Call ended",
            },
        }
    }
}

/// State transitions for calls.
#[derive(Debug, Clone)]
pub enum CallTransition {
    OfferSent,
    AnswerReceived,
    LocalAccepted,
    MediaConnected,
    Terminated { reason: EndReason },
}

/// The aggregate root for one active or pending call attempt.
///
/// Owned exclusively by its controller task; nothing else mutates it.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub id: SessionId,
    pub conversation_id: ConversationId,
    pub role: CallRole,
    pub state: CallState,
    /// Latest known address of the remote signaling endpoint.
    pub peer_address: Option<PeerAddress>,
    pub local_description: Option<SessionDescription>,
    /// Applied remote description. Candidates go to the engine only once this is set.
    pub remote_description: Option<SessionDescription>,
    /// Received but not yet applied remote description.
    pub pending_remote_description: Option<SessionDescription>,
    pending_remote_candidates: VecDeque<IceCandidate>,
    pending_local_candidates: VecDeque<IceCandidate>,
    local_description_signaled: bool,
    pub wants_video: bool,
    pub is_audio_muted: bool,
    pub is_video_enabled: bool,
    pub local_tracks: Vec<MediaTrack>,
    pub remote_tracks: Vec<MediaTrack>,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
}

impl CallSession {
    pub fn new_outgoing(conversation_id: ConversationId, wants_video: bool) -> Self {
        let now = Utc::now();
        Self::with_state(
            conversation_id,
            CallRole::Caller,
            CallState::Outgoing {
                started_at: now,
                offer_sent_at: None,
            },
            wants_video,
        )
    }

    pub fn new_incoming(
        conversation_id: ConversationId,
        peer: PeerAddress,
        offer: SessionDescription,
        video_hint: bool,
    ) -> Self {
        let mut session = Self::with_state(
            conversation_id,
            CallRole::Callee,
            CallState::Incoming {
                received_at: Utc::now(),
            },
            video_hint,
        );
        session.peer_address = Some(peer);
        session.pending_remote_description = Some(offer);
        session
    }

    fn with_state(
        conversation_id: ConversationId,
        role: CallRole,
        state: CallState,
        wants_video: bool,
    ) -> Self {
        Self {
            id: SessionId::next(),
            conversation_id,
            role,
            state,
            peer_address: None,
            local_description: None,
            remote_description: None,
            pending_remote_description: None,
            pending_remote_candidates: VecDeque::new(),
            pending_local_candidates: VecDeque::new(),
            local_description_signaled: false,
            wants_video,
            is_audio_muted: false,
            is_video_enabled: wants_video,
            local_tracks: Vec::new(),
            remote_tracks: Vec::new(),
            created_at: Utc::now(),
            ended_at: None,
            end_reason: None,
        }
    }

    pub fn is_initiator(&self) -> bool {
        self.role == CallRole::Caller
    }

    /// Apply a state transition. Returns error if transition is invalid.
    pub fn apply_transition(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        let now = Utc::now();
        let new_state = match (&self.state, transition) {
            (
                CallState::Outgoing {
                    started_at,
                    offer_sent_at: None,
                },
                CallTransition::OfferSent,
            ) => CallState::Outgoing {
                started_at: *started_at,
                offer_sent_at: Some(now),
            },
            (
                CallState::Outgoing {
                    offer_sent_at: Some(_),
                    ..
                },
                CallTransition::AnswerReceived,
            ) => CallState::Negotiating {
                role: CallRole::Caller,
                since: now,
            },
            (CallState::Incoming { .. }, CallTransition::LocalAccepted) => {
                CallState::Negotiating {
                    role: CallRole::Callee,
                    since: now,
                }
            }
            (CallState::Negotiating { .. }, CallTransition::MediaConnected) => CallState::Active {
                connected_at: now,
            },
            (CallState::Active { connected_at }, CallTransition::Terminated { reason }) => {
                let duration = now.signed_duration_since(*connected_at).num_seconds();
                self.ended_at = Some(now);
                self.end_reason = Some(reason.clone());
                CallState::Ended {
                    reason,
                    ended_at: now,
                    duration_secs: Some(duration),
                }
            }
            (current, CallTransition::Terminated { reason }) if !current.is_ended() => {
                self.ended_at = Some(now);
                self.end_reason = Some(reason.clone());
                CallState::Ended {
                    reason,
                    ended_at: now,
                    duration_secs: None,
                }
            }
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: format!("{:?}", current),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        self.state = new_state;
        Ok(())
    }

    /// Record the sender address of a signaling message. Returns true if it changed.
    pub fn bind_peer(&mut self, peer: PeerAddress) -> bool {
        if self.peer_address.as_ref() == Some(&peer) {
            return false;
        }
        self.peer_address = Some(peer);
        true
    }

    pub fn set_local_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), InvalidTransition> {
        if self.local_description.is_some() {
            return Err(InvalidTransition {
                current_state: format!("{:?}", self.state),
                attempted: "SetLocalDescription (already set)".to_string(),
            });
        }
        self.local_description = Some(description);
        Ok(())
    }

    /// Mark the local description as sent to the peer.
    pub fn mark_local_description_signaled(&mut self) {
        self.local_description_signaled = true;
    }

    /// Offer a remote candidate to the session.
    ///
    /// Returns the candidate back if it may be handed to the engine right away;
    /// otherwise it is queued until the remote description is applied.
    pub fn accept_remote_candidate(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.remote_description.is_some() {
            Some(candidate)
        } else {
            self.pending_remote_candidates.push_back(candidate);
            None
        }
    }

    /// Record the successfully applied remote description and drain the
    /// candidates that were waiting for it, in arrival order.
    pub fn mark_remote_applied(&mut self, description: SessionDescription) -> Vec<IceCandidate> {
        self.pending_remote_description = None;
        self.remote_description = Some(description);
        self.pending_remote_candidates.drain(..).collect()
    }

    pub fn pending_remote_candidate_count(&self) -> usize {
        self.pending_remote_candidates.len()
    }

    fn can_signal_candidates(&self) -> bool {
        self.peer_address.is_some() && self.local_description_signaled
    }

    /// Offer a locally gathered candidate for sending.
    ///
    /// Returns the target and candidate if it may be sent now; otherwise it is
    /// held until the peer is known and our description has gone out.
    pub fn accept_local_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Option<(PeerAddress, IceCandidate)> {
        match &self.peer_address {
            Some(peer) if self.local_description_signaled => Some((peer.clone(), candidate)),
            _ => {
                self.pending_local_candidates.push_back(candidate);
                None
            }
        }
    }

    /// Take held local candidates if they can now be sent.
    pub fn drain_local_candidates(&mut self) -> Option<(PeerAddress, Vec<IceCandidate>)> {
        if !self.can_signal_candidates() || self.pending_local_candidates.is_empty() {
            return None;
        }
        let peer = self.peer_address.clone()?;
        Some((peer, self.pending_local_candidates.drain(..).collect()))
    }

    /// Local media toggles are legal once local media exists and the call is live.
    pub fn can_toggle_media(&self) -> bool {
        !self.state.is_ended() && !self.local_tracks.is_empty()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id,
            conversation_id: self.conversation_id.clone(),
            role: self.role,
            state: self.state.clone(),
            status: self.state.status_text(),
            peer_address: self.peer_address.clone(),
            is_audio_muted: self.is_audio_muted,
            is_video_enabled: self.is_video_enabled,
            local_track: self.local_tracks.first().cloned(),
            remote_track: self.remote_tracks.first().cloned(),
            end_reason: self.end_reason.clone(),
        }
    }
}

/// Read-only view of a session for the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub conversation_id: ConversationId,
    pub role: CallRole,
    pub state: CallState,
    pub status: &'static str,
    pub peer_address: Option<PeerAddress>,
    pub is_audio_muted: bool,
    pub is_video_enabled: bool,
    pub local_track: Option<MediaTrack>,
    pub remote_track: Option<MediaTrack>,
    pub end_reason: Option<EndReason>,
}

impl SessionSnapshot {
    pub fn duration_secs(&self) -> Option<i64> {
        match self.state {
            CallState::Ended { duration_secs, .. } => duration_secs,
            _ => None,
        }
    }

    /// The error an ended session reports to the presentation layer.
    ///
    /// `None` while the call is live and for hangups, declines and glare.
    pub fn failure(&self) -> Option<CallError> {
        match self.end_reason.as_ref()? {
            EndReason::Timeout => Some(CallError::Timeout),
            EndReason::NegotiationTimeout => Some(CallError::NegotiationTimeout),
            EndReason::ConnectionLost => Some(CallError::ConnectionLost),
            EndReason::NegotiationFailed(cause) => Some(match cause {
                NegotiationFailure::MediaUnavailable(msg) => {
                    CallError::MediaUnavailable(msg.clone())
                }
                NegotiationFailure::IncompatibleDescription(msg) => {
                    CallError::IncompatibleDescription(msg.clone())
                }
                NegotiationFailure::DescriptionFailed(msg) => {
                    CallError::Engine(EngineError::Other(msg.clone()))
                }
            }),
            EndReason::LocalHangup
            | EndReason::RemoteHangup
            | EndReason::Declined
            | EndReason::Superseded => None,
        }
    }
}

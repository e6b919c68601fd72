//! Signaling protocol: relay event names and the typed message union.
//!
//! Each message travels as a named relay event with a JSON payload. Payload
//! field names are camelCase and every call payload carries `conversationId`.
//! Directed messages (`answer-made`, `ice-candidate`) also carry `targetPeer`.
//! The relay stamps `from` with the sender's connection id when forwarding.

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::fmt;

use super::error::CallError;
use super::types::{ConversationId, IceCandidate, PeerAddress, SessionDescription};

/// Named relay events used by the call protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingEvent {
    /// Caller → Callee: offer for a conversation.
    CallUser,
    /// Callee → Caller: answer to a previously received offer.
    AnswerMade,
    /// Either direction: one ICE candidate.
    IceCandidate,
    /// Either direction: hang up.
    EndCall,
    /// Callee → Caller: the call was refused (or not answered in time).
    DeclineCall,
    /// Client → relay: room membership.
    JoinConversation,
    /// Client → relay: drop room membership.
    LeaveConversation,
}

impl SignalingEvent {
    pub const ALL: [SignalingEvent; 7] = [
        Self::CallUser,
        Self::AnswerMade,
        Self::IceCandidate,
        Self::EndCall,
        Self::DeclineCall,
        Self::JoinConversation,
        Self::LeaveConversation,
    ];

    /// Event name on the relay connection.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::CallUser => "call-user",
            Self::AnswerMade => "answer-made",
            Self::IceCandidate => "ice-candidate",
            Self::EndCall => "end-call",
            Self::DeclineCall => "decline-call",
            Self::JoinConversation => "join-conversation",
            Self::LeaveConversation => "leave-conversation",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|event| event.name() == name)
    }
}

impl fmt::Display for SignalingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallUserPayload {
    conversation_id: ConversationId,
    offer_description: SessionDescription,
    #[serde(default)]
    video: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    from: Option<PeerAddress>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnswerMadePayload {
    conversation_id: ConversationId,
    target_peer: PeerAddress,
    answer_description: SessionDescription,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    from: Option<PeerAddress>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IceCandidatePayload {
    conversation_id: ConversationId,
    target_peer: PeerAddress,
    candidate: IceCandidate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    from: Option<PeerAddress>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationPayload {
    conversation_id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    from: Option<PeerAddress>,
}

/// Typed signaling message exchanged between the two parties of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    Offer {
        conversation_id: ConversationId,
        description: SessionDescription,
        video: bool,
    },
    Answer {
        conversation_id: ConversationId,
        target_peer: PeerAddress,
        description: SessionDescription,
    },
    IceCandidate {
        conversation_id: ConversationId,
        target_peer: PeerAddress,
        candidate: IceCandidate,
    },
    EndCall {
        conversation_id: ConversationId,
    },
    DeclineCall {
        conversation_id: ConversationId,
    },
}

/// A decoded message together with the sender address the relay stamped on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundSignal {
    pub from: Option<PeerAddress>,
    pub message: SignalingMessage,
}

fn parse<T: DeserializeOwned>(event: SignalingEvent, payload: serde_json::Value) -> Result<T, CallError> {
    serde_json::from_value(payload).map_err(|e| CallError::Parse(format!("{event}: {e}")))
}

impl SignalingMessage {
    pub fn event(&self) -> SignalingEvent {
        match self {
            Self::Offer { .. } => SignalingEvent::CallUser,
            Self::Answer { .. } => SignalingEvent::AnswerMade,
            Self::IceCandidate { .. } => SignalingEvent::IceCandidate,
            Self::EndCall { .. } => SignalingEvent::EndCall,
            Self::DeclineCall { .. } => SignalingEvent::DeclineCall,
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::Offer {
                conversation_id, ..
            }
            | Self::Answer {
                conversation_id, ..
            }
            | Self::IceCandidate {
                conversation_id, ..
            }
            | Self::EndCall { conversation_id }
            | Self::DeclineCall { conversation_id } => conversation_id,
        }
    }

    pub fn target_peer(&self) -> Option<&PeerAddress> {
        match self {
            Self::Answer { target_peer, .. } | Self::IceCandidate { target_peer, .. } => {
                Some(target_peer)
            }
            _ => None,
        }
    }

    /// Serialize to the relay event name and payload.
    pub fn encode(&self) -> Result<(SignalingEvent, serde_json::Value), CallError> {
        let payload = match self.clone() {
            Self::Offer {
                conversation_id,
                description,
                video,
            } => serde_json::to_value(CallUserPayload {
                conversation_id,
                offer_description: description,
                video,
                from: None,
            })?,
            Self::Answer {
                conversation_id,
                target_peer,
                description,
            } => serde_json::to_value(AnswerMadePayload {
                conversation_id,
                target_peer,
                answer_description: description,
                from: None,
            })?,
            Self::IceCandidate {
                conversation_id,
                target_peer,
                candidate,
            } => serde_json::to_value(IceCandidatePayload {
                conversation_id,
                target_peer,
                candidate,
                from: None,
            })?,
            Self::EndCall { conversation_id } | Self::DeclineCall { conversation_id } => {
                serde_json::to_value(ConversationPayload {
                    conversation_id,
                    from: None,
                })?
            }
        };
        Ok((self.event(), payload))
    }

    /// Deserialize a relay event. Returns `Ok(None)` for events that are not
    /// call signaling (room management, unknown names).
    pub fn decode(
        event_name: &str,
        payload: serde_json::Value,
    ) -> Result<Option<InboundSignal>, CallError> {
        let Some(event) = SignalingEvent::from_name(event_name) else {
            return Ok(None);
        };
        let inbound = match event {
            SignalingEvent::CallUser => {
                let p: CallUserPayload = parse(event, payload)?;
                InboundSignal {
                    from: p.from,
                    message: Self::Offer {
                        conversation_id: p.conversation_id,
                        description: p.offer_description,
                        video: p.video,
                    },
                }
            }
            SignalingEvent::AnswerMade => {
                let p: AnswerMadePayload = parse(event, payload)?;
                InboundSignal {
                    from: p.from,
                    message: Self::Answer {
                        conversation_id: p.conversation_id,
                        target_peer: p.target_peer,
                        description: p.answer_description,
                    },
                }
            }
            SignalingEvent::IceCandidate => {
                let p: IceCandidatePayload = parse(event, payload)?;
                InboundSignal {
                    from: p.from,
                    message: Self::IceCandidate {
                        conversation_id: p.conversation_id,
                        target_peer: p.target_peer,
                        candidate: p.candidate,
                    },
                }
            }
            SignalingEvent::EndCall | SignalingEvent::DeclineCall => {
                let p: ConversationPayload = parse(event, payload)?;
                let message = if event == SignalingEvent::EndCall {
                    Self::EndCall {
                        conversation_id: p.conversation_id,
                    }
                } else {
                    Self::DeclineCall {
                        conversation_id: p.conversation_id,
                    }
                };
                InboundSignal {
                    from: p.from,
                    message,
                }
            }
            SignalingEvent::JoinConversation | SignalingEvent::LeaveConversation => return Ok(None),
        };
        Ok(Some(inbound))
    }
}

/// Payload for room membership events.
pub fn room_payload(conversation_id: &ConversationId) -> serde_json::Value {
    serde_json::json!({ "conversationId": conversation_id })
}

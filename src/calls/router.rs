//! Signaling router: binds relay events to call sessions.
//!
//! The router owns the mapping from conversation to live session and an
//! index of which peer addresses each session is bound to. One peer may be
//! bound to sessions in several conversations at once. Every inbound message
//! is routed by the conversation it names; the session itself rebinds to a
//! new sender address. Anything that matches no session is logged and
//! dropped.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, info, trace, warn};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::config::CallConfig;
use super::controller::{CallCommand, CallHandle, CallSessionController, GlareOutcome};
use super::engine::EngineFactory;
use super::error::{CallError, TransportError};
use super::signaling::{InboundSignal, SignalingMessage};
use super::state::{CallSession, SessionSnapshot};
use super::transport::{SignalingTransport, TransportEvent};
use super::types::{ConversationId, EndReason, PeerAddress, SessionDescription, SessionId};

/// Notifications for the presentation layer.
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// A remote offer created a ringing session.
    IncomingCall {
        conversation_id: ConversationId,
        peer: PeerAddress,
        video: bool,
    },
    StateChanged(SessionSnapshot),
    Ended {
        conversation_id: ConversationId,
        session_id: SessionId,
        reason: EndReason,
    },
}

/// Live sessions, the peer index and room membership counts.
pub struct SessionRegistry {
    sessions: DashMap<ConversationId, CallHandle>,
    peers: DashMap<(PeerAddress, ConversationId), SessionId>,
    rooms: DashMap<ConversationId, usize>,
    transport: Arc<dyn SignalingTransport>,
}

impl SessionRegistry {
    fn new(transport: Arc<dyn SignalingTransport>) -> Self {
        Self {
            sessions: DashMap::new(),
            peers: DashMap::new(),
            rooms: DashMap::new(),
            transport,
        }
    }

    pub fn get(&self, conversation_id: &ConversationId) -> Option<CallHandle> {
        self.sessions.get(conversation_id).map(|h| h.value().clone())
    }

    /// Conversations whose live session is bound to `peer`, sorted.
    pub fn conversations_for_peer(&self, peer: &PeerAddress) -> Vec<ConversationId> {
        let mut conversations: Vec<ConversationId> = self
            .peers
            .iter()
            .filter(|entry| entry.key().0 == *peer)
            .map(|entry| entry.key().1.clone())
            .collect();
        conversations.sort();
        conversations
    }

    pub fn is_bound(&self, peer: &PeerAddress, conversation_id: &ConversationId) -> bool {
        self.peers
            .contains_key(&(peer.clone(), conversation_id.clone()))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Insert a handle unless the conversation already has a session.
    fn try_register(&self, handle: CallHandle) -> bool {
        match self.sessions.entry(handle.conversation_id().clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(handle);
                true
            }
        }
    }

    pub(crate) fn bind_peer(
        &self,
        session_id: SessionId,
        peer: PeerAddress,
        conversation_id: ConversationId,
        previous: Option<PeerAddress>,
    ) {
        if let Some(previous) = previous {
            self.peers
                .remove_if(&(previous, conversation_id.clone()), |_, id| *id == session_id);
        }
        self.peers.insert((peer, conversation_id), session_id);
    }

    /// Remove a session that reached `Ended`. A newer session for the same
    /// conversation is left alone.
    pub(crate) async fn deregister(&self, session: &CallSession) {
        let removed = self
            .sessions
            .remove_if(&session.conversation_id, |_, h| h.session_id() == session.id)
            .is_some();
        if let Some(peer) = &session.peer_address {
            self.peers.remove_if(
                &(peer.clone(), session.conversation_id.clone()),
                |_, id| *id == session.id,
            );
        }
        if removed {
            self.release_room(&session.conversation_id).await;
        }
    }

    pub(crate) async fn acquire_room(&self, conversation_id: &ConversationId) {
        let first = {
            let mut count = self.rooms.entry(conversation_id.clone()).or_insert(0);
            *count += 1;
            *count == 1
        };
        if first && let Err(e) = self.transport.join_room(conversation_id).await {
            warn!("Failed to join conversation {}: {}", conversation_id, e);
        }
    }

    pub(crate) async fn release_room(&self, conversation_id: &ConversationId) {
        let now_empty = match self.rooms.get_mut(conversation_id) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        if now_empty {
            self.rooms.remove_if(conversation_id, |_, count| *count == 0);
            if let Err(e) = self.transport.leave_room(conversation_id).await {
                warn!("Failed to leave conversation {}: {}", conversation_id, e);
            }
        }
    }

    fn room_refs(&self, conversation_id: &ConversationId) -> usize {
        self.rooms.get(conversation_id).map(|c| *c).unwrap_or(0)
    }
}

/// Everything a session controller needs from its surroundings.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub config: CallConfig,
    pub transport: Arc<dyn SignalingTransport>,
    pub engines: Arc<dyn EngineFactory>,
    pub registry: Arc<SessionRegistry>,
    pub events: broadcast::Sender<CallEvent>,
}

impl SessionContext {
    /// Serialize and hand to the transport. Never waits for acknowledgment.
    pub async fn send(&self, message: &SignalingMessage) -> Result<(), CallError> {
        if !self.transport.is_connected() {
            return Err(TransportError::Unavailable.into());
        }
        let (event, payload) = message.encode()?;
        trace!("Sending {} for {}", event, message.conversation_id());
        self.transport.emit(event.name(), payload).await?;
        Ok(())
    }
}

/// Maps relay events to call sessions and back.
pub struct SignalingRouter {
    ctx: SessionContext,
}

impl SignalingRouter {
    pub fn new(
        transport: Arc<dyn SignalingTransport>,
        engines: Arc<dyn EngineFactory>,
        config: CallConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let registry = Arc::new(SessionRegistry::new(transport.clone()));
        Arc::new(Self {
            ctx: SessionContext {
                config,
                transport,
                engines,
                registry,
                events,
            },
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.ctx.events.subscribe()
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.ctx.registry
    }

    /// Connect the shared transport. Safe to call when already connected.
    pub async fn connect(&self) -> Result<(), CallError> {
        self.ctx.transport.connect().await?;
        Ok(())
    }

    /// Start pumping inbound transport events into sessions.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let mut inbound = self.ctx.transport.subscribe();
        let router = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match inbound.recv().await {
                    Ok(TransportEvent::EventReceived { name, payload }) => {
                        router.on_receive(&name, payload).await;
                    }
                    Ok(TransportEvent::Connected { local_address }) => {
                        info!("Signaling connected as {:?}", local_address);
                    }
                    Ok(TransportEvent::Disconnected) => {
                        warn!("Signaling transport disconnected");
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Signaling router lagged, {} events dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Signaling router stopped");
        })
    }

    /// Keep room membership for a conversation the user has open, so offers reach us.
    pub async fn watch_conversation(&self, conversation_id: &ConversationId) {
        self.ctx.registry.acquire_room(conversation_id).await;
    }

    pub async fn unwatch_conversation(&self, conversation_id: &ConversationId) {
        self.ctx.registry.release_room(conversation_id).await;
    }

    pub fn session(&self, conversation_id: &ConversationId) -> Option<CallHandle> {
        self.ctx.registry.get(conversation_id)
    }

    /// `None` means the conversation is idle.
    pub fn session_state(&self, conversation_id: &ConversationId) -> Option<SessionSnapshot> {
        self.session(conversation_id).map(|h| h.snapshot())
    }

    /// Place a call. Fails with `AlreadyInCall` without sending anything if
    /// the conversation already has a session.
    pub async fn start_call(
        &self,
        conversation_id: ConversationId,
        wants_video: bool,
    ) -> Result<CallHandle, CallError> {
        let session = CallSession::new_outgoing(conversation_id.clone(), wants_video);
        let (handle, controller) = CallSessionController::prepare(self.ctx.clone(), session);
        if !self.ctx.registry.try_register(handle.clone()) {
            info!("Rejecting call for {}: already in a call", conversation_id);
            return Err(CallError::AlreadyInCall(conversation_id));
        }
        info!(
            "Starting {} call for {}",
            if wants_video { "video" } else { "audio" },
            conversation_id
        );
        self.ctx.registry.acquire_room(&conversation_id).await;
        tokio::spawn(controller.run());
        Ok(handle)
    }

    /// Send a message on behalf of a session.
    pub async fn send(&self, message: &SignalingMessage) -> Result<(), CallError> {
        self.ctx.send(message).await
    }

    /// Handle one raw relay event.
    pub async fn on_receive(&self, event_name: &str, payload: serde_json::Value) {
        let InboundSignal { from, message } = match SignalingMessage::decode(event_name, payload) {
            Ok(Some(inbound)) => inbound,
            Ok(None) => {
                trace!("Ignoring non-call event {}", event_name);
                return;
            }
            Err(e) => {
                warn!("Dropping malformed {} event: {}", event_name, e);
                return;
            }
        };

        if let Some(target) = message.target_peer()
            && let Some(local) = self.ctx.transport.local_address().await
            && *target != local
        {
            debug!(
                "Dropping {} addressed to {} (we are {})",
                message.event(),
                target,
                local
            );
            return;
        }

        match message {
            SignalingMessage::Offer {
                conversation_id,
                description,
                video,
            } => {
                self.route_offer(from, conversation_id, description, video)
                    .await;
            }
            SignalingMessage::Answer { .. } | SignalingMessage::IceCandidate { .. } => {
                let conversation_id = message.conversation_id().clone();
                if let Some(peer) = &from
                    && !self.ctx.registry.is_bound(peer, &conversation_id)
                {
                    debug!(
                        "{} for {} from unbound sender {}; session will rebind",
                        message.event(),
                        conversation_id,
                        peer
                    );
                }
                self.dispatch(&conversation_id, from, message).await;
            }
            SignalingMessage::EndCall { .. } | SignalingMessage::DeclineCall { .. } => {
                let conversation_id = message.conversation_id().clone();
                self.dispatch(&conversation_id, from, message).await;
            }
        }
    }

    async fn dispatch(
        &self,
        conversation_id: &ConversationId,
        from: Option<PeerAddress>,
        message: SignalingMessage,
    ) {
        let event = message.event();
        let Some(handle) = self.ctx.registry.get(conversation_id) else {
            debug!(
                "Dropping unroutable {} for {} from {:?}",
                event, conversation_id, from
            );
            return;
        };
        if handle
            .deliver(CallCommand::Remote { from, message })
            .await
            .is_err()
        {
            debug!(
                "Dropping {} for {}: session already ended",
                event, conversation_id
            );
        }
    }

    async fn route_offer(
        &self,
        from: Option<PeerAddress>,
        conversation_id: ConversationId,
        description: SessionDescription,
        video: bool,
    ) {
        let Some(from) = from else {
            warn!(
                "Dropping offer for {} without a sender address",
                conversation_id
            );
            return;
        };

        if let Some(existing) = self.ctx.registry.get(&conversation_id) {
            match existing.offer_glare(from.clone()).await {
                Ok(GlareOutcome::Ignored) => return,
                Ok(GlareOutcome::Yielded) | Err(CallError::SessionClosed) => {}
                Err(e) => {
                    warn!("Glare check for {} failed: {}", conversation_id, e);
                    return;
                }
            }
        }

        let session = CallSession::new_incoming(conversation_id.clone(), from.clone(), description, video);
        let session_id = session.id;
        let (handle, controller) = CallSessionController::prepare(self.ctx.clone(), session);
        if !self.ctx.registry.try_register(handle) {
            info!(
                "Ignoring offer from {} for {}: already in a call",
                from, conversation_id
            );
            return;
        }
        info!("Incoming call for {} from {}", conversation_id, from);
        self.ctx
            .registry
            .bind_peer(session_id, from, conversation_id.clone(), None);
        self.ctx.registry.acquire_room(&conversation_id).await;
        tokio::spawn(controller.run());
    }

    /// Room membership references currently held for a conversation.
    pub fn room_refs(&self, conversation_id: &ConversationId) -> usize {
        self.ctx.registry.room_refs(conversation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::signaling::SignalingEvent;
    use crate::calls::test_utils::{MemoryRelay, party};
    use serde_json::json;

    /// Events that are not call signaling never create a session.
    #[tokio::test]
    async fn test_room_and_unknown_events_are_ignored() {
        let relay = MemoryRelay::new();
        let client = party(&relay, CallConfig::default()).await;

        client
            .router
            .on_receive("join-conversation", json!({"conversationId": "C1"}))
            .await;
        client
            .router
            .on_receive("typing", json!({"conversationId": "C1"}))
            .await;

        assert_eq!(client.router.registry().len(), 0);
        assert!(relay.sent().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_offer_is_dropped() {
        let relay = MemoryRelay::new();
        let client = party(&relay, CallConfig::default()).await;

        client
            .router
            .on_receive("call-user", json!({"conversationId": "C1", "from": "peer-9"}))
            .await;

        assert!(client.router.session_state(&ConversationId::new("C1")).is_none());
    }

    #[tokio::test]
    async fn test_offer_without_sender_is_dropped() {
        let relay = MemoryRelay::new();
        let client = party(&relay, CallConfig::default()).await;

        client
            .router
            .on_receive(
                "call-user",
                json!({
                    "conversationId": "C1",
                    "offerDescription": {"type": "offer", "sdp": "v=0"},
                }),
            )
            .await;

        assert!(client.router.session(&ConversationId::new("C1")).is_none());
    }

    /// Control messages for a conversation without a session are unroutable.
    #[tokio::test]
    async fn test_unroutable_end_call_is_dropped() {
        let relay = MemoryRelay::new();
        let client = party(&relay, CallConfig::default()).await;

        client
            .router
            .on_receive("end-call", json!({"conversationId": "C1", "from": "peer-9"}))
            .await;

        assert_eq!(client.router.registry().len(), 0);
        assert_eq!(relay.count(SignalingEvent::EndCall), 0);
    }

    /// An offer creates a ringing session bound to its sender.
    #[tokio::test]
    async fn test_offer_creates_incoming_session() {
        let relay = MemoryRelay::new();
        let mut client = party(&relay, CallConfig::default()).await;
        let c1 = ConversationId::new("C1");

        client
            .router
            .on_receive(
                "call-user",
                json!({
                    "conversationId": "C1",
                    "offerDescription": {"type": "offer", "sdp": "v=0"},
                    "video": true,
                    "from": "peer-9",
                }),
            )
            .await;

        let snapshot = client.router.session_state(&c1).expect("session created");
        assert!(snapshot.state.is_ringing());
        assert_eq!(snapshot.peer_address, Some(PeerAddress::new("peer-9")));
        assert!(snapshot.is_video_enabled);
        assert_eq!(
            client
                .router
                .registry()
                .conversations_for_peer(&PeerAddress::new("peer-9")),
            vec![c1.clone()]
        );
        assert_eq!(client.router.room_refs(&c1), 1);

        let event = client.events.recv().await.expect("event delivered");
        assert!(matches!(
            event,
            CallEvent::IncomingCall { ref peer, video: true, .. } if peer.as_str() == "peer-9"
        ));
    }

    /// A candidate from a bound sender naming another conversation is dropped.
    #[tokio::test]
    async fn test_candidate_for_unknown_conversation_is_dropped() {
        let relay = MemoryRelay::new();
        let client = party(&relay, CallConfig::default()).await;
        let c1 = ConversationId::new("C1");

        client
            .router
            .on_receive(
                "call-user",
                json!({
                    "conversationId": "C1",
                    "offerDescription": {"type": "offer", "sdp": "v=0"},
                    "from": "peer-9",
                }),
            )
            .await;
        client
            .router
            .on_receive(
                "ice-candidate",
                json!({
                    "conversationId": "C2",
                    "targetPeer": client.address().as_str(),
                    "candidate": {"candidate": "candidate:1 1 UDP 1 10.0.0.1 9 typ host"},
                    "from": "peer-9",
                }),
            )
            .await;

        assert!(client.router.session(&ConversationId::new("C2")).is_none());
        assert!(client.router.session_state(&c1).expect("still ringing").state.is_ringing());
    }

    #[tokio::test]
    async fn test_send_while_disconnected_is_unavailable() {
        let relay = MemoryRelay::new();
        let client = party(&relay, CallConfig::default()).await;
        client.transport.disconnect().await;

        let err = client
            .router
            .send(&SignalingMessage::EndCall {
                conversation_id: ConversationId::new("C1"),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CallError::Transport(TransportError::Unavailable)
        ));
    }
}

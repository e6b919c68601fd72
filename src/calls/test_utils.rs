//! In-memory relay, transport and scripted engine for call tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, broadcast, mpsc, watch};

use super::config::CallConfig;
use super::controller::CallHandle;
use super::engine::{ConnectionState, EngineEvent, EngineFactory, MediaNegotiationEngine};
use super::error::{EngineError, TransportError};
use super::router::{CallEvent, SignalingRouter};
use super::signaling::SignalingEvent;
use super::state::SessionSnapshot;
use super::transport::{SignalingTransport, TransportEvent};
use super::types::{
    ConversationId, DescriptionKind, IceCandidate, MediaConstraints, MediaTrack, PeerAddress,
    SessionDescription, TrackKind,
};

/// A frame some peer handed to the relay.
#[derive(Debug, Clone)]
pub struct SentFrame {
    pub from: PeerAddress,
    pub event: String,
    pub payload: Value,
}

#[derive(Default)]
struct RelayState {
    peers: HashMap<PeerAddress, broadcast::Sender<TransportEvent>>,
    rooms: HashMap<ConversationId, HashSet<PeerAddress>>,
}

/// Routes frames between [`MemoryTransport`]s the way the real relay does:
/// directed events go to `targetPeer`, others to the rest of the room, and
/// every forwarded payload gets `from` stamped on it.
#[derive(Default)]
pub struct MemoryRelay {
    state: Mutex<RelayState>,
    next_id: AtomicU64,
    sent: Mutex<Vec<SentFrame>>,
}

impl MemoryRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A transport with the next free address (`peer-1`, `peer-2`, ...).
    pub fn transport(self: &Arc<Self>) -> Arc<MemoryTransport> {
        self.new_transport(false)
    }

    /// Like [`transport`](Self::transport), but the relay never tells the
    /// client its own address.
    pub fn anonymous_transport(self: &Arc<Self>) -> Arc<MemoryTransport> {
        self.new_transport(true)
    }

    fn new_transport(self: &Arc<Self>, anonymous: bool) -> Arc<MemoryTransport> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Arc::new(MemoryTransport {
            relay: Arc::clone(self),
            address: PeerAddress::new(format!("peer-{id}")),
            anonymous,
            connected: AtomicBool::new(false),
            events: broadcast::channel(256).0,
        })
    }

    /// Every frame emitted so far, in order.
    pub fn sent(&self) -> Vec<SentFrame> {
        self.sent.lock().expect("relay log poisoned").clone()
    }

    /// Frames with the given event name, in order.
    pub fn sent_events(&self, event: SignalingEvent) -> Vec<SentFrame> {
        self.sent()
            .into_iter()
            .filter(|f| f.event == event.name())
            .collect()
    }

    pub fn count(&self, event: SignalingEvent) -> usize {
        self.sent_events(event).len()
    }

    fn attach(&self, address: &PeerAddress, events: broadcast::Sender<TransportEvent>) {
        let mut state = self.state.lock().expect("relay state poisoned");
        state.peers.insert(address.clone(), events);
    }

    fn detach(&self, address: &PeerAddress) {
        let mut state = self.state.lock().expect("relay state poisoned");
        state.peers.remove(address);
        for members in state.rooms.values_mut() {
            members.remove(address);
        }
    }

    fn membership(&self, address: &PeerAddress, conversation_id: &ConversationId, join: bool) {
        let mut state = self.state.lock().expect("relay state poisoned");
        let members = state.rooms.entry(conversation_id.clone()).or_default();
        if join {
            members.insert(address.clone());
        } else {
            members.remove(address);
        }
    }

    pub fn is_member(&self, address: &PeerAddress, conversation_id: &ConversationId) -> bool {
        let state = self.state.lock().expect("relay state poisoned");
        state
            .rooms
            .get(conversation_id)
            .is_some_and(|m| m.contains(address))
    }

    fn route(&self, from: &PeerAddress, event: &str, mut payload: Value) {
        self.sent.lock().expect("relay log poisoned").push(SentFrame {
            from: from.clone(),
            event: event.to_string(),
            payload: payload.clone(),
        });

        if let Value::Object(map) = &mut payload {
            map.insert("from".into(), Value::String(from.as_str().to_string()));
        }

        let state = self.state.lock().expect("relay state poisoned");
        let recipients: Vec<PeerAddress> = match payload.get("targetPeer").and_then(Value::as_str) {
            Some(target) => vec![PeerAddress::new(target)],
            None => payload
                .get("conversationId")
                .and_then(Value::as_str)
                .and_then(|c| state.rooms.get(&ConversationId::new(c)))
                .map(|members| members.iter().filter(|m| *m != from).cloned().collect())
                .unwrap_or_default(),
        };
        for recipient in recipients {
            if let Some(events) = state.peers.get(&recipient) {
                let _ = events.send(TransportEvent::EventReceived {
                    name: event.to_string(),
                    payload: payload.clone(),
                });
            }
        }
    }

    /// Deliver a raw frame to one peer, bypassing room routing.
    pub fn inject(&self, to: &PeerAddress, event: &str, payload: Value) {
        let state = self.state.lock().expect("relay state poisoned");
        if let Some(events) = state.peers.get(to) {
            let _ = events.send(TransportEvent::EventReceived {
                name: event.to_string(),
                payload,
            });
        }
    }
}

pub struct MemoryTransport {
    relay: Arc<MemoryRelay>,
    address: PeerAddress,
    anonymous: bool,
    connected: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
}

impl MemoryTransport {
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }
}

#[async_trait]
impl SignalingTransport for MemoryTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.relay.attach(&self.address, self.events.clone());
        let _ = self.events.send(TransportEvent::Connected {
            local_address: (!self.anonymous).then(|| self.address.clone()),
        });
        Ok(())
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.relay.detach(&self.address);
            let _ = self.events.send(TransportEvent::Disconnected);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn local_address(&self) -> Option<PeerAddress> {
        (self.is_connected() && !self.anonymous).then(|| self.address.clone())
    }

    async fn join_room(&self, conversation_id: &ConversationId) -> Result<(), TransportError> {
        self.relay.membership(&self.address, conversation_id, true);
        Ok(())
    }

    async fn leave_room(&self, conversation_id: &ConversationId) -> Result<(), TransportError> {
        self.relay.membership(&self.address, conversation_id, false);
        Ok(())
    }

    async fn emit(&self, event: &str, payload: Value) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Unavailable);
        }
        self.relay.route(&self.address, event, payload);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// One call the controller made into a [`FakeEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    AttachLocalMedia(MediaConstraints),
    CreateLocalDescription(DescriptionKind),
    ApplyRemoteDescription(SessionDescription),
    AddRemoteCandidate(IceCandidate),
    SetAudioEnabled(bool),
    SetVideoEnabled(bool),
    SwitchCamera,
    Close,
}

/// Failure injection and gating shared by every engine a factory builds.
#[derive(Clone, Default)]
pub struct FakeEngineOptions {
    pub fail_create: bool,
    pub fail_media: bool,
    pub fail_apply: bool,
    /// When set, `attach_local_media` waits for a notification.
    pub media_gate: Option<Arc<Notify>>,
}

/// Scripted engine. Records every call and lets the test push events.
pub struct FakeEngine {
    conversation_id: ConversationId,
    options: FakeEngineOptions,
    calls: Mutex<Vec<EngineCall>>,
    closes: AtomicUsize,
    remote_applied: AtomicBool,
    early_candidates: AtomicUsize,
    events: mpsc::Sender<EngineEvent>,
}

impl FakeEngine {
    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().expect("engine log poisoned").clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Candidates handed over before a remote description was applied.
    pub fn early_candidate_count(&self) -> usize {
        self.early_candidates.load(Ordering::SeqCst)
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::AddRemoteCandidate(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub async fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event).await;
    }

    pub async fn connect(&self) {
        self.emit(EngineEvent::ConnectionStateChanged(ConnectionState::Connected))
            .await;
    }

    fn record(&self, call: EngineCall) {
        self.calls.lock().expect("engine log poisoned").push(call);
    }
}

#[async_trait]
impl MediaNegotiationEngine for FakeEngine {
    async fn attach_local_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Vec<MediaTrack>, EngineError> {
        self.record(EngineCall::AttachLocalMedia(constraints));
        if let Some(gate) = &self.options.media_gate {
            gate.notified().await;
        }
        if self.options.fail_media {
            return Err(EngineError::MediaUnavailable("camera busy".into()));
        }
        let mut tracks = vec![MediaTrack {
            id: format!("{}-audio", self.conversation_id),
            kind: TrackKind::Audio,
        }];
        if constraints.video {
            tracks.push(MediaTrack {
                id: format!("{}-video", self.conversation_id),
                kind: TrackKind::Video,
            });
        }
        Ok(tracks)
    }

    async fn create_local_description(
        &self,
        kind: DescriptionKind,
    ) -> Result<SessionDescription, EngineError> {
        self.record(EngineCall::CreateLocalDescription(kind));
        let sdp = format!("v=0 {:?} for {}", kind, self.conversation_id);
        Ok(SessionDescription { kind, sdp })
    }

    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.record(EngineCall::ApplyRemoteDescription(description));
        if self.options.fail_apply {
            return Err(EngineError::IncompatibleDescription("no common codec".into()));
        }
        self.remote_applied.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        if !self.remote_applied.load(Ordering::SeqCst) {
            self.early_candidates.fetch_add(1, Ordering::SeqCst);
        }
        self.record(EngineCall::AddRemoteCandidate(candidate));
        Ok(())
    }

    fn set_local_audio_enabled(&self, enabled: bool) {
        self.record(EngineCall::SetAudioEnabled(enabled));
    }

    fn set_local_video_enabled(&self, enabled: bool) {
        self.record(EngineCall::SetVideoEnabled(enabled));
    }

    async fn switch_camera(&self) -> Result<(), EngineError> {
        self.record(EngineCall::SwitchCamera);
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.record(EngineCall::Close);
    }
}

#[derive(Default)]
pub struct FakeEngineFactory {
    options: Mutex<FakeEngineOptions>,
    engines: Mutex<Vec<Arc<FakeEngine>>>,
}

impl FakeEngineFactory {
    pub fn with_options(options: FakeEngineOptions) -> Arc<Self> {
        Arc::new(Self {
            options: Mutex::new(options),
            engines: Mutex::new(Vec::new()),
        })
    }

    pub fn set_options(&self, options: FakeEngineOptions) {
        *self.options.lock().expect("factory options poisoned") = options;
    }

    pub fn engines(&self) -> Vec<Arc<FakeEngine>> {
        self.engines.lock().expect("factory log poisoned").clone()
    }

    pub fn last(&self) -> Option<Arc<FakeEngine>> {
        self.engines().last().cloned()
    }
}

impl EngineFactory for FakeEngineFactory {
    fn create(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<(Arc<dyn MediaNegotiationEngine>, mpsc::Receiver<EngineEvent>), EngineError> {
        let options = self.options.lock().expect("factory options poisoned").clone();
        if options.fail_create {
            return Err(EngineError::Other("engine unavailable".into()));
        }
        let (tx, rx) = mpsc::channel(64);
        let engine = Arc::new(FakeEngine {
            conversation_id: conversation_id.clone(),
            options,
            calls: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            remote_applied: AtomicBool::new(false),
            early_candidates: AtomicUsize::new(0),
            events: tx,
        });
        self.engines
            .lock()
            .expect("factory log poisoned")
            .push(engine.clone());
        Ok((engine, rx))
    }
}

/// One client: a router on its own transport and engine factory.
pub struct Party {
    pub router: Arc<SignalingRouter>,
    pub transport: Arc<MemoryTransport>,
    pub engines: Arc<FakeEngineFactory>,
    pub events: broadcast::Receiver<CallEvent>,
}

impl Party {
    pub fn address(&self) -> &PeerAddress {
        self.transport.address()
    }

    pub fn session(&self, conversation_id: &ConversationId) -> Option<CallHandle> {
        self.router.session(conversation_id)
    }

    /// Wait until the router has a session for the conversation.
    pub async fn wait_for_session(&self, conversation_id: &ConversationId) -> CallHandle {
        let router = self.router.clone();
        let conversation_id = conversation_id.clone();
        let mut found = None;
        eventually(|| {
            found = router.session(&conversation_id);
            found.is_some()
        })
        .await;
        found.expect("session should appear")
    }

    pub fn engine(&self) -> Arc<FakeEngine> {
        self.engines.last().expect("an engine should have been created")
    }
}

/// Connect a party to the relay and start its router.
pub async fn party(relay: &Arc<MemoryRelay>, config: CallConfig) -> Party {
    party_with(relay, config, FakeEngineOptions::default()).await
}

pub async fn party_with(
    relay: &Arc<MemoryRelay>,
    config: CallConfig,
    options: FakeEngineOptions,
) -> Party {
    start_party(relay.transport(), config, options).await
}

/// A party whose relay connection never reports its own address.
pub async fn anonymous_party(relay: &Arc<MemoryRelay>, config: CallConfig) -> Party {
    start_party(
        relay.anonymous_transport(),
        config,
        FakeEngineOptions::default(),
    )
    .await
}

async fn start_party(
    transport: Arc<MemoryTransport>,
    config: CallConfig,
    options: FakeEngineOptions,
) -> Party {
    let engines = FakeEngineFactory::with_options(options);
    let router = SignalingRouter::new(transport.clone(), engines.clone(), config);
    let events = router.subscribe_events();
    router.start();
    router.connect().await.expect("memory transport connects");
    Party {
        router,
        transport,
        engines,
        events,
    }
}

/// Poll until `check` holds, letting other tasks run between attempts.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

/// Wait for a snapshot matching `pred` and return it.
pub async fn wait_for_state(
    handle: &CallHandle,
    pred: impl Fn(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    let mut rx: watch::Receiver<SessionSnapshot> = handle.subscribe();
    let snapshot = tokio::time::timeout(Duration::from_secs(600), rx.wait_for(|s| pred(s)))
        .await
        .expect("state not reached in time")
        .expect("state channel closed");
    snapshot.clone()
}

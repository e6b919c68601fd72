//! Per-session call controller.
//!
//! Each [`CallSessionController`] runs as its own task and is the only owner
//! of its [`CallSession`]. User intents, routed signaling and engine callbacks
//! all arrive as messages and are applied one at a time, so they never
//! interleave against the session state.
//!
//! Slow engine steps (local media, description creation, applying the remote
//! description) run in spawned tasks and re-enter the controller as
//! [`CallCommand::Completion`] tagged with the generation that requested them.
//! Ending a session bumps the generation, so anything still in flight is
//! discarded when it completes.

use log::{debug, info, trace, warn};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until};

use super::engine::{ConnectionState, EngineEvent, MediaNegotiationEngine};
use super::error::{CallError, EngineError, InvalidTransition};
use super::router::{CallEvent, SessionContext};
use super::signaling::SignalingMessage;
use super::state::{CallSession, CallState, CallTransition, SessionSnapshot};
use super::types::{
    CallRole, ConversationId, DescriptionKind, EndReason, IceCandidate, MediaConstraints,
    MediaTrack, PeerAddress, SessionDescription, SessionId,
};

/// Result of offering a second `Offer` to an existing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GlareOutcome {
    /// The existing session ended in favour of the new offer.
    Yielded,
    /// The new offer must be dropped.
    Ignored,
}

/// Output of a spawned engine step.
#[derive(Debug)]
pub(crate) enum StepOutcome {
    LocalMedia(Result<Vec<MediaTrack>, EngineError>),
    LocalDescription(Result<SessionDescription, EngineError>),
    RemoteApplied {
        description: SessionDescription,
        result: Result<(), EngineError>,
    },
}

#[derive(Debug)]
pub(crate) enum CallCommand {
    Accept {
        wants_video: bool,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Decline {
        reply: oneshot::Sender<()>,
    },
    End {
        reply: oneshot::Sender<()>,
    },
    ToggleMute {
        reply: oneshot::Sender<bool>,
    },
    ToggleVideo {
        reply: oneshot::Sender<bool>,
    },
    SwitchCamera {
        reply: oneshot::Sender<bool>,
    },
    Remote {
        from: Option<PeerAddress>,
        message: SignalingMessage,
    },
    RemoteOffer {
        from: PeerAddress,
        reply: oneshot::Sender<GlareOutcome>,
    },
    Completion {
        generation: u64,
        step: StepOutcome,
    },
}

/// Intent surface of one call session for the presentation layer.
#[derive(Debug, Clone)]
pub struct CallHandle {
    session_id: SessionId,
    conversation_id: ConversationId,
    commands: mpsc::Sender<CallCommand>,
    state: watch::Receiver<SessionSnapshot>,
}

impl CallHandle {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Current state, role and media flags.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    /// Observe state changes. The last state stays readable after the session ends.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.clone()
    }

    pub fn is_ended(&self) -> bool {
        self.state.borrow().state.is_ended()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> CallCommand,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| CallError::SessionClosed)?;
        rx.await.map_err(|_| CallError::SessionClosed)
    }

    pub(crate) async fn deliver(&self, command: CallCommand) -> Result<(), CallError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| CallError::SessionClosed)
    }

    pub(crate) async fn offer_glare(&self, from: PeerAddress) -> Result<GlareOutcome, CallError> {
        self.request(|reply| CallCommand::RemoteOffer { from, reply })
            .await
    }

    /// Answer an incoming call. Only valid while ringing.
    pub async fn accept_call(&self, wants_video: bool) -> Result<(), CallError> {
        self.request(|reply| CallCommand::Accept { wants_video, reply })
            .await?
    }

    /// Refuse an incoming call. From any other live state this hangs up.
    pub async fn decline_call(&self) -> Result<(), CallError> {
        match self.request(|reply| CallCommand::Decline { reply }).await {
            Ok(()) | Err(CallError::SessionClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Hang up. A no-op on a session that already ended.
    pub async fn end_call(&self) -> Result<(), CallError> {
        match self.request(|reply| CallCommand::End { reply }).await {
            Ok(()) | Err(CallError::SessionClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Returns false if there is no local media to toggle, including after
    /// the session ended.
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        self.media_request(|reply| CallCommand::ToggleMute { reply })
            .await
    }

    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        self.media_request(|reply| CallCommand::ToggleVideo { reply })
            .await
    }

    pub async fn switch_camera(&self) -> Result<bool, CallError> {
        self.media_request(|reply| CallCommand::SwitchCamera { reply })
            .await
    }

    async fn media_request(
        &self,
        make: impl FnOnce(oneshot::Sender<bool>) -> CallCommand,
    ) -> Result<bool, CallError> {
        match self.request(make).await {
            Err(CallError::SessionClosed) => {
                warn!("Ignoring media toggle for {}: session ended", self.conversation_id);
                Ok(false)
            }
            other => other,
        }
    }
}

/// The state machine task for one call attempt.
pub struct CallSessionController {
    session: CallSession,
    ctx: SessionContext,
    commands: mpsc::Receiver<CallCommand>,
    completions: mpsc::WeakSender<CallCommand>,
    engine: Option<Arc<dyn MediaNegotiationEngine>>,
    engine_events: Option<mpsc::Receiver<EngineEvent>>,
    generation: u64,
    state_tx: watch::Sender<SessionSnapshot>,
    ring_deadline: Option<Instant>,
    negotiation_deadline: Option<Instant>,
    disconnect_deadline: Option<Instant>,
}

impl CallSessionController {
    /// Build a controller and its handle. The caller registers the handle
    /// before spawning [`run`](Self::run).
    pub(crate) fn prepare(ctx: SessionContext, session: CallSession) -> (CallHandle, Self) {
        let (tx, rx) = mpsc::channel(ctx.config.command_buffer.max(1));
        let (state_tx, state_rx) = watch::channel(session.snapshot());
        let completions = tx.downgrade();
        let handle = CallHandle {
            session_id: session.id,
            conversation_id: session.conversation_id.clone(),
            commands: tx,
            state: state_rx,
        };
        let controller = Self {
            session,
            ctx,
            commands: rx,
            completions,
            engine: None,
            engine_events: None,
            generation: 0,
            state_tx,
            ring_deadline: None,
            negotiation_deadline: None,
            disconnect_deadline: None,
        };
        (handle, controller)
    }

    pub async fn run(mut self) {
        debug!(
            "Call controller {} started for {} as {:?}",
            self.session.id, self.session.conversation_id, self.session.role
        );
        self.on_start().await;

        while !self.session.state.is_ended() {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = next_engine_event(&mut self.engine_events) => match event {
                    Some(event) => self.handle_engine_event(event).await,
                    None => self.engine_events = None,
                },
                _ = sleep_until_opt(self.ring_deadline) => {
                    self.ring_deadline = None;
                    info!("Incoming call for {} not answered in time", self.session.conversation_id);
                    let notify = self.decline_message();
                    self.finish(EndReason::Timeout, Some(notify)).await;
                }
                _ = sleep_until_opt(self.negotiation_deadline) => {
                    self.negotiation_deadline = None;
                    warn!("Negotiation for {} timed out", self.session.conversation_id);
                    let notify = self.end_message();
                    self.finish(EndReason::NegotiationTimeout, Some(notify)).await;
                }
                _ = sleep_until_opt(self.disconnect_deadline) => {
                    self.disconnect_deadline = None;
                    warn!("Connection for {} did not recover", self.session.conversation_id);
                    let notify = self.end_message();
                    self.finish(EndReason::ConnectionLost, Some(notify)).await;
                }
            }
        }

        if !self.session.state.is_ended() {
            // Every handle is gone; nobody can hang up any more.
            let notify = self.end_message();
            self.finish(EndReason::LocalHangup, Some(notify)).await;
        }
        debug!("Call controller {} stopped", self.session.id);
    }

    async fn on_start(&mut self) {
        match self.session.role {
            CallRole::Caller => {
                self.negotiation_deadline =
                    Some(Instant::now() + self.ctx.config.negotiation_timeout());
                if self.create_engine().await {
                    let constraints = MediaConstraints::for_call(self.session.wants_video);
                    self.spawn_local_media(constraints);
                }
            }
            CallRole::Callee => {
                self.ring_deadline = Some(Instant::now() + self.ctx.config.ring_timeout());
                if let Some(peer) = self.session.peer_address.clone() {
                    let _ = self.ctx.events.send(CallEvent::IncomingCall {
                        conversation_id: self.session.conversation_id.clone(),
                        peer,
                        video: self.session.wants_video,
                    });
                }
            }
        }
        self.publish();
    }

    async fn handle_command(&mut self, command: CallCommand) {
        match command {
            CallCommand::Accept { wants_video, reply } => {
                let result = self.accept(wants_video).await;
                let _ = reply.send(result);
            }
            CallCommand::Decline { reply } => {
                if self.session.state.is_ringing() {
                    info!("Declining call for {}", self.session.conversation_id);
                    let notify = self.decline_message();
                    self.finish(EndReason::Declined, Some(notify)).await;
                } else {
                    self.hang_up().await;
                }
                let _ = reply.send(());
            }
            CallCommand::End { reply } => {
                self.hang_up().await;
                let _ = reply.send(());
            }
            CallCommand::ToggleMute { reply } => {
                let applied = self.toggle_mute();
                let _ = reply.send(applied);
            }
            CallCommand::ToggleVideo { reply } => {
                let applied = self.toggle_video();
                let _ = reply.send(applied);
            }
            CallCommand::SwitchCamera { reply } => {
                let applied = self.switch_camera().await;
                let _ = reply.send(applied);
            }
            CallCommand::Remote { from, message } => self.handle_remote(from, message).await,
            CallCommand::RemoteOffer { from, reply } => {
                let outcome = self.resolve_glare(from).await;
                let _ = reply.send(outcome);
            }
            CallCommand::Completion { generation, step } => {
                if generation != self.generation || self.session.state.is_ended() {
                    debug!(
                        "Discarding stale engine step for {} (generation {} != {})",
                        self.session.conversation_id, generation, self.generation
                    );
                    return;
                }
                self.handle_completion(step).await;
            }
        }
    }

    async fn accept(&mut self, wants_video: bool) -> Result<(), CallError> {
        if !self.session.state.can_accept() {
            return Err(InvalidTransition {
                current_state: format!("{:?}", self.session.state),
                attempted: "LocalAccepted".to_string(),
            }
            .into());
        }
        let Some(offer) = self.session.pending_remote_description.clone() else {
            return Err(CallError::NotFound(self.session.conversation_id.clone()));
        };

        self.session.apply_transition(CallTransition::LocalAccepted)?;
        self.session.wants_video = wants_video;
        self.session.is_video_enabled = wants_video;
        self.ring_deadline = None;
        self.negotiation_deadline = Some(Instant::now() + self.ctx.config.negotiation_timeout());
        info!("Accepted call for {}", self.session.conversation_id);
        self.publish();

        if self.create_engine().await {
            self.spawn_apply_remote(offer);
        }
        Ok(())
    }

    async fn hang_up(&mut self) {
        if self.session.state.is_ended() {
            return;
        }
        info!("Hanging up call for {}", self.session.conversation_id);
        let notify = self.end_message();
        self.finish(EndReason::LocalHangup, Some(notify)).await;
    }

    async fn resolve_glare(&mut self, from: PeerAddress) -> GlareOutcome {
        let outgoing = matches!(self.session.state, CallState::Outgoing { .. });
        if !outgoing {
            info!(
                "Ignoring offer from {} for {}: already in a call",
                from, self.session.conversation_id
            );
            return GlareOutcome::Ignored;
        }
        match self.ctx.transport.local_address().await {
            Some(local) if local < from => {
                info!(
                    "Offer glare on {}: yielding to {} (we are {})",
                    self.session.conversation_id, from, local
                );
                self.finish(EndReason::Superseded, None).await;
                GlareOutcome::Yielded
            }
            Some(local) => {
                info!(
                    "Offer glare on {}: keeping our offer over {} (we are {})",
                    self.session.conversation_id, from, local
                );
                GlareOutcome::Ignored
            }
            None => {
                // Without our own address the tie cannot be broken; keep the
                // offer and let the negotiation timeout settle it.
                warn!(
                    "Offer glare on {} with {} but our address is unknown; keeping our offer",
                    self.session.conversation_id, from
                );
                GlareOutcome::Ignored
            }
        }
    }

    async fn handle_remote(&mut self, from: Option<PeerAddress>, message: SignalingMessage) {
        match message {
            SignalingMessage::Answer { description, .. } => {
                let Some(from) = from else {
                    warn!(
                        "Dropping answer for {} without a sender address",
                        self.session.conversation_id
                    );
                    return;
                };
                if let Err(e) = self.session.apply_transition(CallTransition::AnswerReceived) {
                    debug!("Ignoring answer for {}: {}", self.session.conversation_id, e);
                    return;
                }
                self.rebind_peer(from);
                self.session.pending_remote_description = Some(description.clone());
                self.flush_local_candidates().await;
                self.publish();
                self.spawn_apply_remote(description);
            }
            SignalingMessage::IceCandidate { candidate, .. } => {
                if let Some(from) = from {
                    self.rebind_peer(from);
                }
                if let Some(candidate) = self.session.accept_remote_candidate(candidate) {
                    self.deliver_remote_candidate(candidate).await;
                } else {
                    trace!(
                        "Queued remote candidate for {} ({} pending)",
                        self.session.conversation_id,
                        self.session.pending_remote_candidate_count()
                    );
                }
            }
            SignalingMessage::EndCall { .. } => {
                info!("Remote hung up {}", self.session.conversation_id);
                self.finish(EndReason::RemoteHangup, None).await;
            }
            SignalingMessage::DeclineCall { .. } => {
                info!("Remote declined {}", self.session.conversation_id);
                self.finish(EndReason::Declined, None).await;
            }
            SignalingMessage::Offer { .. } => {
                debug!(
                    "Offer for {} reached the session directly; ignoring",
                    self.session.conversation_id
                );
            }
        }
    }

    async fn handle_completion(&mut self, step: StepOutcome) {
        match step {
            StepOutcome::LocalMedia(Ok(tracks)) => {
                debug!(
                    "Local media ready for {} ({} tracks)",
                    self.session.conversation_id,
                    tracks.len()
                );
                self.session.local_tracks = tracks;
                if let Some(engine) = &self.engine {
                    engine.set_local_audio_enabled(!self.session.is_audio_muted);
                    engine.set_local_video_enabled(self.session.is_video_enabled);
                }
                self.publish();
                let kind = match self.session.role {
                    CallRole::Caller => DescriptionKind::Offer,
                    CallRole::Callee => DescriptionKind::Answer,
                };
                self.spawn_local_description(kind);
            }
            StepOutcome::LocalDescription(Ok(description)) => {
                if let Err(e) = self.session.set_local_description(description.clone()) {
                    warn!("Ignoring second local description: {}", e);
                    return;
                }
                let message = match self.session.role {
                    CallRole::Caller => SignalingMessage::Offer {
                        conversation_id: self.session.conversation_id.clone(),
                        description,
                        video: self.session.wants_video,
                    },
                    CallRole::Callee => {
                        let Some(peer) = self.session.peer_address.clone() else {
                            warn!("No peer to answer for {}", self.session.conversation_id);
                            return;
                        };
                        SignalingMessage::Answer {
                            conversation_id: self.session.conversation_id.clone(),
                            target_peer: peer,
                            description,
                        }
                    }
                };
                self.send(message).await;
                self.session.mark_local_description_signaled();
                if self.session.role == CallRole::Caller
                    && let Err(e) = self.session.apply_transition(CallTransition::OfferSent)
                {
                    warn!("{}", e);
                }
                self.flush_local_candidates().await;
                self.publish();
            }
            StepOutcome::RemoteApplied {
                description,
                result: Ok(()),
            } => {
                let flushed = self.session.mark_remote_applied(description);
                debug!(
                    "Remote description applied for {}, flushing {} candidates",
                    self.session.conversation_id,
                    flushed.len()
                );
                for candidate in flushed {
                    self.deliver_remote_candidate(candidate).await;
                }
                if self.session.role == CallRole::Callee {
                    let constraints = MediaConstraints::for_call(self.session.wants_video);
                    self.spawn_local_media(constraints);
                }
            }
            StepOutcome::LocalMedia(Err(e))
            | StepOutcome::LocalDescription(Err(e))
            | StepOutcome::RemoteApplied { result: Err(e), .. } => self.fail(e).await,
        }
    }

    async fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::LocalCandidate(candidate) => {
                if let Some((peer, candidate)) = self.session.accept_local_candidate(candidate) {
                    self.send_candidate(peer, candidate).await;
                }
            }
            EngineEvent::ConnectionStateChanged(state) => self.on_connection_state(state).await,
            EngineEvent::RemoteTrack(track) => {
                debug!("Remote {:?} track for {}", track.kind, self.session.conversation_id);
                self.session.remote_tracks.push(track);
                self.publish();
            }
        }
    }

    async fn on_connection_state(&mut self, state: ConnectionState) {
        debug!("Engine for {} is {}", self.session.conversation_id, state);
        match state {
            ConnectionState::Connected => {
                self.disconnect_deadline = None;
                if self.session.state.is_negotiating() {
                    match self.session.apply_transition(CallTransition::MediaConnected) {
                        Ok(()) => {
                            self.negotiation_deadline = None;
                            info!("Call for {} is active", self.session.conversation_id);
                            self.publish();
                        }
                        Err(e) => warn!("{}", e),
                    }
                }
            }
            ConnectionState::Disconnected => {
                let live = self.session.state.is_active() || self.session.state.is_negotiating();
                if live && self.disconnect_deadline.is_none() {
                    self.disconnect_deadline =
                        Some(Instant::now() + self.ctx.config.disconnect_grace());
                }
            }
            ConnectionState::Failed => {
                warn!("Engine connection failed for {}", self.session.conversation_id);
                let notify = self.end_message();
                self.finish(EndReason::ConnectionLost, Some(notify)).await;
            }
            ConnectionState::Connecting | ConnectionState::Closed => {}
        }
    }

    fn toggle_mute(&mut self) -> bool {
        let Some(engine) = self.toggle_target("mute") else {
            return false;
        };
        self.session.is_audio_muted = !self.session.is_audio_muted;
        engine.set_local_audio_enabled(!self.session.is_audio_muted);
        self.publish();
        true
    }

    fn toggle_video(&mut self) -> bool {
        let Some(engine) = self.toggle_target("video") else {
            return false;
        };
        self.session.is_video_enabled = !self.session.is_video_enabled;
        engine.set_local_video_enabled(self.session.is_video_enabled);
        self.publish();
        true
    }

    async fn switch_camera(&mut self) -> bool {
        let Some(engine) = self.toggle_target("camera switch") else {
            return false;
        };
        if let Err(e) = engine.switch_camera().await {
            warn!("Camera switch failed for {}: {}", self.session.conversation_id, e);
            return false;
        }
        true
    }

    fn toggle_target(&self, what: &str) -> Option<Arc<dyn MediaNegotiationEngine>> {
        match &self.engine {
            Some(engine) if self.session.can_toggle_media() => Some(engine.clone()),
            _ => {
                warn!(
                    "Ignoring {} for {}: no local media in state {:?}",
                    what, self.session.conversation_id, self.session.state
                );
                None
            }
        }
    }

    async fn create_engine(&mut self) -> bool {
        match self.ctx.engines.create(&self.session.conversation_id) {
            Ok((engine, events)) => {
                self.engine = Some(engine);
                self.engine_events = Some(events);
                true
            }
            Err(e) => {
                self.fail(e).await;
                false
            }
        }
    }

    fn spawn_step<F>(&self, step: F)
    where
        F: Future<Output = StepOutcome> + Send + 'static,
    {
        let Some(completions) = self.completions.upgrade() else {
            return;
        };
        let generation = self.generation;
        tokio::spawn(async move {
            let step = step.await;
            let _ = completions
                .send(CallCommand::Completion { generation, step })
                .await;
        });
    }

    fn spawn_local_media(&self, constraints: MediaConstraints) {
        let Some(engine) = self.engine.clone() else {
            return;
        };
        self.spawn_step(async move {
            StepOutcome::LocalMedia(engine.attach_local_media(constraints).await)
        });
    }

    fn spawn_local_description(&self, kind: DescriptionKind) {
        let Some(engine) = self.engine.clone() else {
            return;
        };
        self.spawn_step(async move {
            StepOutcome::LocalDescription(engine.create_local_description(kind).await)
        });
    }

    fn spawn_apply_remote(&self, description: SessionDescription) {
        let Some(engine) = self.engine.clone() else {
            return;
        };
        self.spawn_step(async move {
            let result = engine.apply_remote_description(description.clone()).await;
            StepOutcome::RemoteApplied {
                description,
                result,
            }
        });
    }

    async fn deliver_remote_candidate(&self, candidate: IceCandidate) {
        let Some(engine) = &self.engine else {
            return;
        };
        if let Err(e) = engine.add_remote_candidate(candidate).await {
            warn!(
                "Engine rejected remote candidate for {}: {}",
                self.session.conversation_id, e
            );
        }
    }

    fn rebind_peer(&mut self, peer: PeerAddress) {
        let previous = self.session.peer_address.clone();
        if self.session.bind_peer(peer.clone()) {
            if previous.is_some() {
                info!(
                    "Peer for {} moved from {:?} to {}",
                    self.session.conversation_id, previous, peer
                );
            }
            self.ctx.registry.bind_peer(
                self.session.id,
                peer,
                self.session.conversation_id.clone(),
                previous,
            );
            self.publish();
        }
    }

    async fn flush_local_candidates(&mut self) {
        if let Some((peer, candidates)) = self.session.drain_local_candidates() {
            for candidate in candidates {
                self.send_candidate(peer.clone(), candidate).await;
            }
        }
    }

    async fn send_candidate(&self, peer: PeerAddress, candidate: IceCandidate) {
        self.send(SignalingMessage::IceCandidate {
            conversation_id: self.session.conversation_id.clone(),
            target_peer: peer,
            candidate,
        })
        .await;
    }

    /// Best-effort send; failures are logged and never retried.
    async fn send(&self, message: SignalingMessage) {
        if let Err(e) = self.ctx.send(&message).await {
            warn!(
                "Failed to send {} for {}: {}",
                message.event(),
                self.session.conversation_id,
                e
            );
        }
    }

    fn end_message(&self) -> SignalingMessage {
        SignalingMessage::EndCall {
            conversation_id: self.session.conversation_id.clone(),
        }
    }

    fn decline_message(&self) -> SignalingMessage {
        SignalingMessage::DeclineCall {
            conversation_id: self.session.conversation_id.clone(),
        }
    }

    async fn fail(&mut self, error: EngineError) {
        warn!(
            "Negotiation failed for {}: {}",
            self.session.conversation_id, error
        );
        // Nothing went out yet for a caller that never sent its offer.
        let notify = match self.session.state {
            CallState::Outgoing {
                offer_sent_at: None,
                ..
            } => None,
            _ => Some(self.end_message()),
        };
        self.finish(EndReason::NegotiationFailed(error.into_failure()), notify)
            .await;
    }

    /// Move to `Ended`: signal the peer, release the engine exactly once,
    /// publish, and deregister.
    async fn finish(&mut self, reason: EndReason, notify: Option<SignalingMessage>) {
        if self.session.state.is_ended() {
            return;
        }
        self.generation += 1;

        if let Some(message) = notify {
            self.send(message).await;
        }
        if let Some(engine) = self.engine.take() {
            engine.close().await;
        }
        self.engine_events = None;
        self.ring_deadline = None;
        self.negotiation_deadline = None;
        self.disconnect_deadline = None;

        if let Err(e) = self.session.apply_transition(CallTransition::Terminated {
            reason: reason.clone(),
        }) {
            warn!("{}", e);
        }
        info!(
            "Call for {} ended: {}",
            self.session.conversation_id, reason
        );
        self.publish();
        let _ = self.ctx.events.send(CallEvent::Ended {
            conversation_id: self.session.conversation_id.clone(),
            session_id: self.session.id,
            reason,
        });
        self.ctx.registry.deregister(&self.session).await;
    }

    fn publish(&self) {
        let snapshot = self.session.snapshot();
        self.state_tx.send_replace(snapshot.clone());
        let _ = self.ctx.events.send(CallEvent::StateChanged(snapshot));
    }
}

async fn next_engine_event(events: &mut Option<mpsc::Receiver<EngineEvent>>) -> Option<EngineEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

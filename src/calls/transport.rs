//! Signaling transport: one persistent connection to the relay.
//!
//! The transport is a dumb pipe for named events. It knows about room
//! membership but nothing about calls. Frames on the wire are JSON text:
//!
//! ```json
//! {"event": "ice-candidate", "data": {"conversationId": "...", ...}}
//! ```
//!
//! On connect the relay identifies the connection with
//! `{"event": "connected", "data": {"peerId": "..."}}`; that id is our
//! [`PeerAddress`] as seen by the other party.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::config::RelayConfig;
use super::error::TransportError;
use super::signaling::{SignalingEvent, room_payload};
use super::types::{ConversationId, PeerAddress};

/// Relay frame announcing our own connection id.
pub const CONNECTED_EVENT: &str = "connected";

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// An event produced by the transport layer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The relay accepted the connection and told us our address.
    Connected { local_address: Option<PeerAddress> },
    /// A named event arrived from the relay.
    EventReceived {
        name: String,
        payload: serde_json::Value,
    },
    /// The connection was lost.
    Disconnected,
}

/// Process-wide connection to the signaling relay.
///
/// `connect`, `join_room` and `leave_room` are idempotent. Sends are
/// fire-and-forget; delivery is the relay's concern.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;

    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Our own address on the relay, once known.
    async fn local_address(&self) -> Option<PeerAddress>;

    async fn join_room(&self, conversation_id: &ConversationId) -> Result<(), TransportError>;

    async fn leave_room(&self, conversation_id: &ConversationId) -> Result<(), TransportError>;

    async fn emit(&self, event: &str, payload: serde_json::Value) -> Result<(), TransportError>;

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}

#[derive(Debug, Serialize, Deserialize)]
struct RelayFrame {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectedPayload {
    peer_id: PeerAddress,
}

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

/// State of the current relay connection, shared with its reader task.
///
/// Every connection gets a new epoch. A reader only touches the state while
/// its epoch is current, so a reader for a replaced connection cannot tear
/// down its successor.
#[derive(Default)]
struct Link {
    epoch: AtomicU64,
    connected: AtomicBool,
    sink: Mutex<Option<WsSink>>,
    address: RwLock<Option<PeerAddress>>,
}

impl Link {
    /// Install a new connection and return its epoch.
    async fn open(&self, sink: Option<WsSink>) -> u64 {
        let mut guard = self.sink.lock().await;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        *guard = sink;
        *self.address.write().await = None;
        self.connected.store(true, Ordering::SeqCst);
        epoch
    }

    /// Record our relay address. Returns false if `epoch` was replaced.
    async fn set_address(&self, epoch: u64, address: Option<PeerAddress>) -> bool {
        let mut current = self.address.write().await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return false;
        }
        *current = address;
        true
    }

    /// Clear the connection opened at `epoch`. Returns false, leaving the
    /// state alone, if a newer connection or a disconnect replaced it.
    async fn teardown(&self, epoch: u64) -> bool {
        let mut guard = self.sink.lock().await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return false;
        }
        self.connected.store(false, Ordering::SeqCst);
        *guard = None;
        *self.address.write().await = None;
        true
    }

    /// Invalidate the current connection and hand back its sink.
    async fn close(&self) -> (bool, Option<WsSink>) {
        let mut guard = self.sink.lock().await;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        *self.address.write().await = None;
        (was_connected, guard.take())
    }
}

/// WebSocket connection to the relay.
pub struct WebSocketTransport {
    config: RelayConfig,
    link: Arc<Link>,
    rooms: Mutex<HashSet<ConversationId>>,
    events: broadcast::Sender<TransportEvent>,
    connect_lock: Mutex<()>,
}

impl WebSocketTransport {
    pub fn new(config: RelayConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            link: Arc::new(Link::default()),
            rooms: Mutex::new(HashSet::new()),
            events: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            connect_lock: Mutex::new(()),
        })
    }

    async fn send_frame(&self, event: &str, data: serde_json::Value) -> Result<(), TransportError> {
        let text = serde_json::to_string(&RelayFrame {
            event: event.to_string(),
            data,
        })
        .map_err(|e| TransportError::Send(e.to_string()))?;

        let mut sink_guard = self.link.sink.lock().await;
        let sink = sink_guard.as_mut().ok_or(TransportError::Unavailable)?;
        debug!("--> {} ({} bytes)", event, text.len());
        sink.send(Message::text(text))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

#[async_trait]
impl SignalingTransport for WebSocketTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            debug!("Relay connect requested but already connected");
            return Ok(());
        }

        info!("Dialing relay {}", self.config.url);
        let (ws, _response) = tokio::time::timeout(
            self.config.connect_timeout(),
            connect_async(self.config.url.as_str()),
        )
        .await
        .map_err(|_| TransportError::ConnectTimeout)?
        .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (sink, stream) = ws.split();
        let epoch = self.link.open(Some(sink)).await;
        tokio::spawn(read_pump(stream, self.events.clone(), self.link.clone(), epoch));

        // Membership requested while offline is replayed on every connect.
        let rooms: Vec<ConversationId> = self.rooms.lock().await.iter().cloned().collect();
        for room in rooms {
            if let Err(e) = self
                .send_frame(SignalingEvent::JoinConversation.name(), room_payload(&room))
                .await
            {
                warn!("Failed to rejoin conversation {}: {}", room, e);
            }
        }
        Ok(())
    }

    async fn disconnect(&self) {
        let (was_connected, sink) = self.link.close().await;
        if let Some(mut sink) = sink
            && let Err(e) = sink.close().await
        {
            debug!("Closing relay connection: {}", e);
        }
        if was_connected {
            info!("Disconnected from relay");
            let _ = self.events.send(TransportEvent::Disconnected);
        }
    }

    fn is_connected(&self) -> bool {
        self.link.connected.load(Ordering::SeqCst)
    }

    async fn local_address(&self) -> Option<PeerAddress> {
        self.link.address.read().await.clone()
    }

    async fn join_room(&self, conversation_id: &ConversationId) -> Result<(), TransportError> {
        if !self.rooms.lock().await.insert(conversation_id.clone()) {
            trace!("Already joined conversation {}", conversation_id);
            return Ok(());
        }
        if !self.is_connected() {
            debug!("Join for {} deferred until connected", conversation_id);
            return Ok(());
        }
        self.send_frame(
            SignalingEvent::JoinConversation.name(),
            room_payload(conversation_id),
        )
        .await
    }

    async fn leave_room(&self, conversation_id: &ConversationId) -> Result<(), TransportError> {
        if !self.rooms.lock().await.remove(conversation_id) || !self.is_connected() {
            return Ok(());
        }
        self.send_frame(
            SignalingEvent::LeaveConversation.name(),
            room_payload(conversation_id),
        )
        .await
    }

    async fn emit(&self, event: &str, payload: serde_json::Value) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Unavailable);
        }
        self.send_frame(event, payload).await
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

async fn read_pump(
    mut stream: WsStream,
    events: broadcast::Sender<TransportEvent>,
    link: Arc<Link>,
    epoch: u64,
) {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                let frame: RelayFrame = match serde_json::from_str(text.as_str()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Dropping malformed relay frame: {}", e);
                        continue;
                    }
                };
                trace!("<-- {}", frame.event);
                let event = if frame.event == CONNECTED_EVENT {
                    let address = serde_json::from_value::<ConnectedPayload>(frame.data)
                        .map(|p| p.peer_id)
                        .ok();
                    if !link.set_address(epoch, address.clone()).await {
                        debug!("Ignoring address for a replaced relay connection");
                        break;
                    }
                    info!("Relay connection established as {:?}", address);
                    TransportEvent::Connected {
                        local_address: address,
                    }
                } else {
                    TransportEvent::EventReceived {
                        name: frame.event,
                        payload: frame.data,
                    }
                };
                // No subscribers is not an error; the router may not be running yet.
                let _ = events.send(event);
            }
            Some(Ok(Message::Close(_))) => {
                trace!("Received close frame");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!("Error reading from relay: {e}");
                break;
            }
            None => {
                trace!("Relay stream ended");
                break;
            }
        }
    }

    if link.teardown(epoch).await {
        let _ = events.send(TransportEvent::Disconnected);
    } else {
        debug!("Reader for replaced relay connection {} exited", epoch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_relay_frame_shape() {
        let frame = RelayFrame {
            event: "end-call".into(),
            data: json!({"conversationId": "C1"}),
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"event": "end-call", "data": {"conversationId": "C1"}})
        );
    }

    #[test]
    fn test_connected_payload_parses_peer_id() {
        let payload: ConnectedPayload =
            serde_json::from_value(json!({"peerId": "sock-42"})).unwrap();
        assert_eq!(payload.peer_id, PeerAddress::new("sock-42"));
    }

    #[tokio::test]
    async fn test_emit_while_disconnected_is_unavailable() {
        let transport = WebSocketTransport::new(RelayConfig::new("ws://127.0.0.1:9"));
        let err = transport
            .emit("end-call", json!({"conversationId": "C1"}))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unavailable));
    }

    #[tokio::test]
    async fn test_join_while_disconnected_is_remembered() {
        let transport = WebSocketTransport::new(RelayConfig::new("ws://127.0.0.1:9"));
        let room = ConversationId::new("C1");
        transport.join_room(&room).await.unwrap();
        transport.join_room(&room).await.unwrap();
        assert!(transport.rooms.lock().await.contains(&room));
        transport.leave_room(&room).await.unwrap();
        assert!(transport.rooms.lock().await.is_empty());
    }

    /// A reader for a replaced connection exits without touching the new one.
    #[tokio::test]
    async fn test_stale_reader_teardown_keeps_new_connection() {
        let link = Link::default();
        let first = link.open(None).await;
        let second = link.open(None).await;

        assert!(link.set_address(second, Some(PeerAddress::new("sock-2"))).await);
        assert!(!link.set_address(first, Some(PeerAddress::new("sock-1"))).await);
        assert!(!link.teardown(first).await);
        assert!(link.connected.load(Ordering::SeqCst));
        assert_eq!(
            *link.address.read().await,
            Some(PeerAddress::new("sock-2"))
        );

        assert!(link.teardown(second).await);
        assert!(!link.connected.load(Ordering::SeqCst));
        assert!(link.address.read().await.is_none());
    }

    /// After a local disconnect the old reader finds nothing to tear down.
    #[tokio::test]
    async fn test_disconnect_invalidates_reader() {
        let transport = WebSocketTransport::new(RelayConfig::new("ws://127.0.0.1:9"));
        let mut events = transport.subscribe();
        let epoch = transport.link.open(None).await;
        assert!(transport.is_connected());

        transport.disconnect().await;
        assert!(!transport.is_connected());
        assert!(matches!(events.try_recv(), Ok(TransportEvent::Disconnected)));
        assert!(!transport.link.teardown(epoch).await);
        assert!(events.try_recv().is_err());
    }
}

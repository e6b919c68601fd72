use call_signaling::calls::{
    ConversationId, InboundSignal, RelayConfig, SignalingMessage, SignalingTransport,
    TransportEvent, WebSocketTransport,
};
use chrono::Local;
use clap::Parser;
use log::{error, info, warn};
use tokio::sync::broadcast::error::RecvError;

// Connects to a signaling relay, joins the given conversations and logs every
// call message that passes through them.
//
// Usage:
//   cargo run -- --relay ws://localhost:3000/ws -c C1 -c C2
//   cargo run -- --relay wss://relay.example --conversation C1 --raw

#[derive(Parser)]
#[command(name = "signal-probe")]
#[command(about = "Watch call signaling on a relay")]
struct Cli {
    /// Relay WebSocket URL.
    #[arg(short, long)]
    relay: String,

    /// Conversation to join; may be repeated.
    #[arg(short, long = "conversation", required = true)]
    conversations: Vec<String>,

    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,

    /// Also print the raw JSON payload of each event.
    #[arg(long)]
    raw: bool,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let cli = Cli::parse();
    let transport = WebSocketTransport::new(RelayConfig {
        url: cli.relay.clone(),
        connect_timeout_secs: cli.connect_timeout,
    });

    let mut events = transport.subscribe();
    transport.connect().await?;
    for conversation in &cli.conversations {
        transport
            .join_room(&ConversationId::new(conversation.as_str()))
            .await?;
        info!("Watching conversation {}", conversation);
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(TransportEvent::Connected { local_address }) => {
                    info!("Relay assigned address {:?}", local_address);
                }
                Ok(TransportEvent::EventReceived { name, payload }) => {
                    if cli.raw {
                        info!("{} {}", name, payload);
                    }
                    log_signal(&name, payload);
                }
                Ok(TransportEvent::Disconnected) => {
                    error!("Relay connection closed");
                    break;
                }
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} relay events", skipped),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, leaving conversations");
                leave_conversations(&*transport, &cli.conversations).await;
                transport.disconnect().await;
                break;
            }
        }
    }

    Ok(())
}

/// Leave every conversation, returning the ones the relay could not be told about.
async fn leave_conversations(
    transport: &dyn SignalingTransport,
    conversations: &[String],
) -> Vec<String> {
    let mut failed = Vec::new();
    for conversation in conversations {
        if let Err(e) = transport
            .leave_room(&ConversationId::new(conversation.as_str()))
            .await
        {
            warn!("Failed to leave conversation {}: {}", conversation, e);
            failed.push(conversation.clone());
        }
    }
    failed
}

fn log_signal(name: &str, payload: serde_json::Value) {
    match SignalingMessage::decode(name, payload) {
        Ok(Some(InboundSignal { from, message })) => {
            let sender = from.map(|p| p.to_string()).unwrap_or_else(|| "?".into());
            match &message {
                SignalingMessage::Offer { video, .. } => info!(
                    "{} offer from {} ({})",
                    message.conversation_id(),
                    sender,
                    if *video { "video" } else { "audio" }
                ),
                SignalingMessage::Answer { target_peer, .. } => info!(
                    "{} answer {} -> {}",
                    message.conversation_id(),
                    sender,
                    target_peer
                ),
                SignalingMessage::IceCandidate {
                    target_peer,
                    candidate,
                    ..
                } => info!(
                    "{} candidate {} -> {}: {}",
                    message.conversation_id(),
                    sender,
                    target_peer,
                    candidate.candidate
                ),
                SignalingMessage::EndCall { .. } | SignalingMessage::DeclineCall { .. } => info!(
                    "{} {} from {}",
                    message.conversation_id(),
                    message.event(),
                    sender
                ),
            }
        }
        Ok(None) => info!("Ignoring non-call event {}", name),
        Err(e) => warn!("Malformed {} event: {}", name, e),
    }
}

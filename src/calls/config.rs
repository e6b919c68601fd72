use serde::Deserialize;
use std::time::Duration;

/// Configuration for call sessions.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Ring timeout in seconds before an unanswered incoming call is declined.
    pub ring_timeout_secs: u64,
    /// Time allowed from offer (or accept) until the engine reports connected.
    pub negotiation_timeout_secs: u64,
    /// How long a `disconnected` engine state may persist before the call is dropped.
    pub disconnect_grace_secs: u64,
    /// Capacity of each session's command channel.
    pub command_buffer: usize,
    /// Capacity of the call event broadcast channel.
    pub event_buffer: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout_secs: 60,
            negotiation_timeout_secs: 30,
            disconnect_grace_secs: 5,
            command_buffer: 64,
            event_buffer: 100,
        }
    }
}

impl CallConfig {
    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_secs)
    }
}

/// Where and how to reach the signaling relay.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    pub url: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl RelayConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

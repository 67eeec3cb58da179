//! Mesh configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{MeshError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// WebSocket URL of the signaling relay
    pub relay_url: String,
    /// STUN/TURN urls handed to every peer connection
    pub ice_servers: Vec<String>,
    /// How long a peer may stay outside `Connected` before it is failed
    pub negotiation_timeout_secs: u64,
    /// How often stalled negotiations are swept
    pub reap_interval_ms: u64,
    /// Buffer for relay messages waiting on the coordinator
    pub inbound_capacity: usize,
    /// Buffer for remote-media notifications per subscriber
    pub event_capacity: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8080".to_string(),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            negotiation_timeout_secs: 30,
            reap_interval_ms: 1000,
            inbound_capacity: 100,
            event_capacity: 64,
        }
    }
}

impl MeshConfig {
    #[must_use]
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    #[must_use]
    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.relay_url.trim().is_empty() {
            return Err(MeshError::Config("relay_url must not be empty".to_string()));
        }
        if self.reap_interval_ms == 0 {
            return Err(MeshError::Config("reap_interval_ms must be positive".to_string()));
        }
        if self.inbound_capacity == 0 || self.event_capacity == 0 {
            return Err(MeshError::Config("channel capacities must be positive".to_string()));
        }
        Ok(())
    }
}

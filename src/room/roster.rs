use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::connection::{NegotiationState, PeerConnection, Role};
use crate::error::{MeshError, Result};
use crate::room::monitor::PeerStatus;
use crate::types::PeerId;

/// Live connections of the current room session, at most one per remote id.
#[derive(Debug, Default)]
pub struct PeerRoster {
    peers: HashMap<PeerId, Arc<PeerConnection>>,
}

impl PeerRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, peer: Arc<PeerConnection>) -> Result<()> {
        if self.peers.contains_key(peer.remote_id()) {
            return Err(MeshError::DuplicateJoin(peer.remote_id().clone()));
        }
        self.peers.insert(peer.remote_id().clone(), peer);
        Ok(())
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn get(&self, id: &PeerId) -> Option<&Arc<PeerConnection>> {
        self.peers.get(id)
    }

    /// Entry for `id` only if it is still the connection generation `conn_id`
    pub fn get_current(&self, id: &PeerId, conn_id: u64) -> Option<&Arc<PeerConnection>> {
        self.peers.get(id).filter(|peer| peer.conn_id() == conn_id)
    }

    pub fn remove(&mut self, id: &PeerId) -> Option<Arc<PeerConnection>> {
        self.peers.remove(id)
    }

    pub fn remove_current(&mut self, id: &PeerId, conn_id: u64) -> Option<Arc<PeerConnection>> {
        self.get_current(id, conn_id)?;
        self.peers.remove(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn count_by_role(&self, role: Role) -> usize {
        self.peers.values().filter(|peer| peer.role() == role).count()
    }

    pub fn connected(&self) -> Vec<Arc<PeerConnection>> {
        self.peers
            .values()
            .filter(|peer| peer.state() == NegotiationState::Connected)
            .cloned()
            .collect()
    }

    pub fn stalled(&self, timeout: Duration, now: Instant) -> Vec<Arc<PeerConnection>> {
        self.peers
            .values()
            .filter(|peer| peer.is_stalled(timeout, now))
            .cloned()
            .collect()
    }

    pub fn drain(&mut self) -> Vec<Arc<PeerConnection>> {
        self.peers.drain().map(|(_, peer)| peer).collect()
    }

    /// Sorted by remote id
    pub fn snapshot(&self) -> Vec<PeerStatus> {
        let mut peers: Vec<PeerStatus> = self
            .peers
            .values()
            .map(|peer| PeerStatus {
                remote_id: peer.remote_id().clone(),
                role: peer.role(),
                state: peer.state(),
            })
            .collect();
        peers.sort_by(|a, b| a.remote_id.cmp(&b.remote_id));
        peers
    }
}

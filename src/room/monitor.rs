//! Read-only hooks for the display layer

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use webrtc::track::track_remote::TrackRemote;

use crate::connection::{NegotiationState, Role};
use crate::types::{PeerId, RoomId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerStatus {
    pub remote_id: PeerId,
    pub role: Role,
    pub state: NegotiationState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RosterSnapshot {
    pub room: Option<RoomId>,
    pub peers: Vec<PeerStatus>,
}

impl RosterSnapshot {
    pub fn state_of(&self, id: &PeerId) -> Option<NegotiationState> {
        self.peers
            .iter()
            .find(|p| &p.remote_id == id)
            .map(|p| p.state)
    }
}

#[derive(Clone)]
pub enum RemoteMediaEvent {
    TrackAdded {
        remote: PeerId,
        track: Arc<TrackRemote>,
    },
    /// A peer announced new capture devices
    Refreshed { remote: Option<PeerId> },
    /// Peer left the roster; drop its media
    Removed { remote: PeerId },
}

impl fmt::Debug for RemoteMediaEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteMediaEvent::TrackAdded { remote, track } => {
                write!(f, "TrackAdded({remote}, {})", track.id())
            }
            RemoteMediaEvent::Refreshed { remote } => write!(f, "Refreshed({remote:?})"),
            RemoteMediaEvent::Removed { remote } => write!(f, "Removed({remote})"),
        }
    }
}

/// Roster snapshots go out on a watch channel, remote media on a broadcast.
pub struct RoomMonitor {
    roster: watch::Sender<RosterSnapshot>,
    media: broadcast::Sender<RemoteMediaEvent>,
}

impl RoomMonitor {
    pub fn new(capacity: usize) -> Self {
        let (roster, _) = watch::channel(RosterSnapshot::default());
        let (media, _) = broadcast::channel(capacity);
        Self { roster, media }
    }

    pub fn publish_roster(&self, snapshot: RosterSnapshot) {
        self.roster.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    pub fn publish_media(&self, event: RemoteMediaEvent) {
        // No subscribers is fine
        let _ = self.media.send(event);
    }

    pub fn roster(&self) -> RosterSnapshot {
        self.roster.borrow().clone()
    }

    pub fn subscribe_roster(&self) -> watch::Receiver<RosterSnapshot> {
        self.roster.subscribe()
    }

    pub fn subscribe_media(&self) -> broadcast::Receiver<RemoteMediaEvent> {
        self.media.subscribe()
    }
}

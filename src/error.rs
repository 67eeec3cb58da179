use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

use crate::connection::NegotiationState;
use crate::types::PeerId;

/// Why a capture request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaAccessKind {
    PermissionDenied,
    DeviceBusy,
    DeviceNotFound,
}

impl std::fmt::Display for MediaAccessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaAccessKind::PermissionDenied => write!(f, "permission denied"),
            MediaAccessKind::DeviceBusy => write!(f, "device busy"),
            MediaAccessKind::DeviceNotFound => write!(f, "device not found"),
        }
    }
}

/// Local capture failures. All of them are recoverable by retrying or
/// picking another device.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("device enumeration denied: {0}")]
    DeviceEnumeration(String),

    #[error("media access failed ({kind}): {message}")]
    MediaAccess {
        kind: MediaAccessKind,
        message: String,
    },

    #[error("audio output routing failed: {0}")]
    OutputRouting(String),
}

impl MediaError {
    pub fn access(kind: MediaAccessKind, message: impl Into<String>) -> Self {
        MediaError::MediaAccess {
            kind,
            message: message.into(),
        }
    }
}

/// Failure of a single peer's offer/answer handshake. Never fatal to the room.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed session description: {0}")]
    MalformedBlob(#[from] serde_json::Error),

    #[error("cannot {action} while {state}")]
    InvalidTransition {
        state: NegotiationState,
        action: &'static str,
    },

    #[error("negotiation did not complete in time")]
    Timeout,
}

impl From<WebRTCError> for NegotiationError {
    fn from(err: WebRTCError) -> Self {
        NegotiationError::Transport(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("message codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("relay handshake failed: {0}")]
    Handshake(String),

    #[error("relay channel closed")]
    ChannelClosed,
}

#[derive(Debug, Error)]
pub enum MeshError {
    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error("stale {kind} for unknown peer {peer}")]
    StaleMessage { kind: &'static str, peer: PeerId },

    #[error("peer {0} is already in the roster")]
    DuplicateJoin(PeerId),

    #[error("unable to join room: {0}")]
    JoinFailed(#[source] MediaError),

    #[error("not joined to a room")]
    NotJoined,

    #[error("already joined to a room")]
    AlreadyJoined,

    #[error("coordinator has stopped")]
    Stopped,

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, MeshError>;

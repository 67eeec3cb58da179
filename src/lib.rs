//! Full-mesh audio/video calls over WebRTC.
//!
//! A participant joins a room through a WebSocket relay and opens one
//! peer connection to every other participant. The relay only forwards
//! session descriptions; media flows directly between peers.

pub mod audio;
pub mod config;
pub mod connection;
pub mod error;
pub mod media;
pub mod room;
pub mod signaling;
pub mod transport;
pub mod types;

pub use config::MeshConfig;
pub use connection::{NegotiationState, PeerConnection, Role};
pub use error::{MediaError, MeshError, NegotiationError, Result, SignalingError};
pub use media::{DeviceList, LocalMediaManager, StreamHandle};
pub use room::{MeshHandle, RemoteMediaEvent, RosterSnapshot, SignalingCoordinator};
pub use signaling::{RelayClient, SignalingMessage, WsRelayClient};
pub use types::{PeerId, RoomId};

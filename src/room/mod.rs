pub mod coordinator;
pub mod monitor;
pub mod roster;

pub use coordinator::{MeshCommand, MeshHandle, SignalingCoordinator};
pub use monitor::{PeerStatus, RemoteMediaEvent, RoomMonitor, RosterSnapshot};
pub use roster::PeerRoster;

//! Peer-to-peer mesh plumbing for signaling channels.
//!
//! * [`negotiation::PeerConnection`] runs one side of an offer/answer
//!   exchange and persists its progress.
//! * [`graph::ConnectionGraph`] answers structural questions about the
//!   stored connections and removes them in cascades.
//! * [`tree::TreeBuilder`] snapshots the rebroadcast tree below a root peer.

pub mod config;
pub mod error;
pub mod graph;
pub mod lifecycle;
pub mod mock;
pub mod model;
pub mod negotiation;
pub mod notify;
pub mod rtc;
pub mod signaling;
pub mod store;
pub mod telemetry;
pub mod transport;
pub mod tree;

pub use config::MeshConfig;
pub use error::{MeshError, MeshResult};
pub use graph::ConnectionGraph;
pub use lifecycle::{LifecycleHooks, MeshContext, PeerDirectory};
pub use model::{
    ChannelId, ConnectionFilter, ConnectionId, ConnectionState, NewPeer, Peer,
    PeerConnectionRecord, PeerId, Role,
};
pub use negotiation::{ConnectionInit, PeerConnection, PeerConnectionEvent};
pub use notify::{ConnectionEvent, Notifier};
pub use signaling::{LocalSignalingChannel, SignalMessage, SignalingChannel, SignalingError};
pub use store::{ConnectionStore, MemoryStore, StoreError};
pub use transport::{RtcTransport, TransportError, TransportEvent, TransportFactory};
pub use tree::{TreeBuilder, TreeNode};

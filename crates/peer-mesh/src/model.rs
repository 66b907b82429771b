//! Records shared between the store, the connection graph and the
//! negotiation engine.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

record_id!(
    /// Identity of a peer record.
    PeerId
);
record_id!(
    /// Identity of a peer connection record.
    ConnectionId
);
record_id!(
    /// Identity of the signaling channel a peer joined.
    ChannelId
);

/// Persisted negotiation progress of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Reserved,
    Connecting,
    InitEstablished,
    RecvEstablished,
    Established,
}

impl ConnectionState {
    /// State after `role` commits a completed offer/answer exchange.
    ///
    /// Each side moves the record to its own half-established state; once
    /// the other half has already committed, the record becomes
    /// `Established`. Repeated commits from the same side are no-ops.
    pub fn finalize(self, role: Role) -> ConnectionState {
        match (self, role) {
            (ConnectionState::Established, _) => ConnectionState::Established,
            (ConnectionState::InitEstablished, Role::Receiver)
            | (ConnectionState::RecvEstablished, Role::Initiator) => ConnectionState::Established,
            (ConnectionState::InitEstablished, Role::Initiator) => ConnectionState::InitEstablished,
            (ConnectionState::RecvEstablished, Role::Receiver) => ConnectionState::RecvEstablished,
            (ConnectionState::Reserved | ConnectionState::Connecting, Role::Initiator) => {
                ConnectionState::InitEstablished
            }
            (ConnectionState::Reserved | ConnectionState::Connecting, Role::Receiver) => {
                ConnectionState::RecvEstablished
            }
        }
    }
}

/// Which side of a connection this process drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Initiator,
    Receiver,
}

/// A directed edge between two peers.
///
/// The initiator dials the endpoint; in rebroadcast terms the endpoint is
/// upstream of the initiator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConnectionRecord {
    pub id: ConnectionId,
    pub initiator: PeerId,
    pub endpoint: PeerId,
    pub state: ConnectionState,
}

impl PeerConnectionRecord {
    pub fn touches(&self, peer: &PeerId) -> bool {
        &self.initiator == peer || &self.endpoint == peer
    }
}

/// A participant in a signaling channel, with the connections it
/// initiated populated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub socket_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub channel: ChannelId,
    pub broadcaster: bool,
    #[serde(default)]
    pub connections: Vec<PeerConnectionRecord>,
}

/// Fields required to register a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPeer {
    pub socket_id: String,
    #[serde(default)]
    pub user: Option<String>,
    pub channel: ChannelId,
    #[serde(default)]
    pub broadcaster: bool,
}

impl NewPeer {
    pub fn new(socket_id: impl Into<String>, channel: ChannelId) -> Self {
        Self {
            socket_id: socket_id.into(),
            user: None,
            channel,
            broadcaster: false,
        }
    }

    pub fn broadcaster(mut self) -> Self {
        self.broadcaster = true;
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }
}

/// Secondary criteria for connection queries. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionFilter {
    pub id: Option<ConnectionId>,
    pub initiator: Option<PeerId>,
    pub endpoint: Option<PeerId>,
    /// Matches when the peer is either the initiator or the endpoint.
    pub touching: Option<PeerId>,
    /// Matches when the state is any of these. Empty means any state.
    pub states: Vec<ConnectionState>,
}

impl ConnectionFilter {
    pub fn any() -> Self {
        Self::default()
    }

    /// The rebroadcast default: established connections only.
    pub fn established() -> Self {
        Self::any().with_state(ConnectionState::Established)
    }

    pub fn by_id(id: ConnectionId) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    pub fn with_state(mut self, state: ConnectionState) -> Self {
        if !self.states.contains(&state) {
            self.states.push(state);
        }
        self
    }

    pub fn initiator(mut self, peer: PeerId) -> Self {
        self.initiator = Some(peer);
        self
    }

    pub fn endpoint(mut self, peer: PeerId) -> Self {
        self.endpoint = Some(peer);
        self
    }

    pub fn touching(mut self, peer: PeerId) -> Self {
        self.touching = Some(peer);
        self
    }

    /// Narrow `self` with every criterion set on `extra`.
    pub fn merge(mut self, extra: &ConnectionFilter) -> Self {
        if extra.id.is_some() {
            self.id = extra.id.clone();
        }
        if extra.initiator.is_some() {
            self.initiator = extra.initiator.clone();
        }
        if extra.endpoint.is_some() {
            self.endpoint = extra.endpoint.clone();
        }
        if extra.touching.is_some() {
            self.touching = extra.touching.clone();
        }
        if !extra.states.is_empty() {
            self.states = extra.states.clone();
        }
        self
    }

    pub fn matches(&self, record: &PeerConnectionRecord) -> bool {
        self.id.as_ref().is_none_or(|id| &record.id == id)
            && self
                .initiator
                .as_ref()
                .is_none_or(|peer| &record.initiator == peer)
            && self
                .endpoint
                .as_ref()
                .is_none_or(|peer| &record.endpoint == peer)
            && self.touching.as_ref().is_none_or(|peer| record.touches(peer))
            && (self.states.is_empty() || self.states.contains(&record.state))
    }
}

//! Persistence contract for peers and peer connections.
//!
//! The store is authoritative for a peer's connection set; the graph and
//! the negotiation engine only read through it and request mutations.

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{
    ConnectionFilter, ConnectionId, ConnectionState, NewPeer, Peer, PeerConnectionRecord, PeerId,
    Role,
};

mod memory;

pub use memory::MemoryStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store rejected request: {0}")]
    Rejected(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn create_peer(&self, peer: NewPeer) -> Result<Peer, StoreError>;

    /// Look up a peer with its initiated connections populated.
    async fn find_peer(&self, id: &PeerId) -> Result<Option<Peer>, StoreError>;

    /// Every peer, populated, in registration order.
    async fn list_peers(&self) -> Result<Vec<Peer>, StoreError>;

    /// Remove the peer record only. Connections are the caller's concern.
    async fn destroy_peer(&self, id: &PeerId) -> Result<Option<Peer>, StoreError>;

    async fn find_connections(
        &self,
        filter: &ConnectionFilter,
    ) -> Result<Vec<PeerConnectionRecord>, StoreError>;

    /// Allocate a new `reserved` connection between two distinct peers.
    async fn reserve_connection(
        &self,
        initiator: &PeerId,
        endpoint: &PeerId,
    ) -> Result<PeerConnectionRecord, StoreError>;

    async fn update_connection_state(
        &self,
        id: &ConnectionId,
        state: ConnectionState,
    ) -> Result<PeerConnectionRecord, StoreError>;

    /// Move a connection from `from` to `to` as one atomic step. Returns
    /// `None`, leaving the record alone, when it is no longer in `from`.
    async fn transition_connection(
        &self,
        id: &ConnectionId,
        from: ConnectionState,
        to: ConnectionState,
    ) -> Result<Option<PeerConnectionRecord>, StoreError>;

    /// Commit one side's completed negotiation. Defaults to retrying
    /// [`Self::transition_connection`] until no concurrent writer got in
    /// between; backends can override with a single atomic update.
    async fn finalize_connection(
        &self,
        id: &ConnectionId,
        role: Role,
    ) -> Result<PeerConnectionRecord, StoreError> {
        loop {
            let current = self
                .find_connections(&ConnectionFilter::by_id(id.clone()))
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| StoreError::Rejected(format!("connection {id} does not exist")))?;
            let next = current.state.finalize(role);
            if next == current.state {
                return Ok(current);
            }
            if let Some(updated) = self.transition_connection(id, current.state, next).await? {
                return Ok(updated);
            }
        }
    }

    /// Remove every matching connection, returning the removed records.
    async fn destroy_connections(
        &self,
        filter: &ConnectionFilter,
    ) -> Result<Vec<PeerConnectionRecord>, StoreError>;
}

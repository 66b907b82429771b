//! Structural queries over peer connections and cascading removal.
//!
//! Direction convention: a connection's initiator dials its endpoint, and
//! the endpoint is upstream. A peer's children are therefore the
//! connections it is the endpoint of, and its parents the connections it
//! initiated.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{MeshError, MeshResult};
use crate::lifecycle::LifecycleHooks;
use crate::model::{ConnectionFilter, ConnectionState, Peer, PeerConnectionRecord, PeerId};
use crate::notify::{ConnectionEvent, Notifier};
use crate::store::ConnectionStore;

#[derive(Clone)]
pub struct ConnectionGraph {
    store: Arc<dyn ConnectionStore>,
    notifier: Notifier,
}

impl ConnectionGraph {
    pub fn new(store: Arc<dyn ConnectionStore>, notifier: Notifier) -> Self {
        Self { store, notifier }
    }

    /// Broadcasters always qualify; anyone else needs at least one
    /// established connection of its own.
    pub fn can_rebroadcast(peer: &Peer) -> bool {
        peer.broadcaster
            || peer
                .connections
                .iter()
                .any(|record| record.state == ConnectionState::Established)
    }

    pub async fn children_of(
        &self,
        peer: &Peer,
        extra: Option<&ConnectionFilter>,
    ) -> MeshResult<Vec<PeerConnectionRecord>> {
        self.query(ConnectionFilter::any().endpoint(peer.id.clone()), extra)
            .await
    }

    pub async fn parents_of(
        &self,
        peer: &Peer,
        extra: Option<&ConnectionFilter>,
    ) -> MeshResult<Vec<PeerConnectionRecord>> {
        self.query(ConnectionFilter::any().initiator(peer.id.clone()), extra)
            .await
    }

    /// The peer's own (initiated) connections, narrowed by `criteria`.
    pub async fn connections_by_peer_id(
        &self,
        peer_id: &PeerId,
        criteria: Option<&ConnectionFilter>,
    ) -> MeshResult<Vec<PeerConnectionRecord>> {
        let peer = self.load_peer(peer_id).await?;
        Ok(peer
            .connections
            .into_iter()
            .filter(|record| criteria.is_none_or(|filter| filter.matches(record)))
            .collect())
    }

    pub async fn children_by_peer_id(
        &self,
        peer_id: &PeerId,
        extra: Option<&ConnectionFilter>,
    ) -> MeshResult<Vec<PeerConnectionRecord>> {
        let peer = self.load_peer(peer_id).await?;
        self.children_of(&peer, extra).await
    }

    pub async fn parents_by_peer_id(
        &self,
        peer_id: &PeerId,
        extra: Option<&ConnectionFilter>,
    ) -> MeshResult<Vec<PeerConnectionRecord>> {
        let peer = self.load_peer(peer_id).await?;
        self.parents_of(&peer, extra).await
    }

    pub async fn can_rebroadcast_by_peer_id(&self, peer_id: &PeerId) -> MeshResult<bool> {
        let peer = self.load_peer(peer_id).await?;
        Ok(Self::can_rebroadcast(&peer))
    }

    /// Remove every matching connection as one batch and publish a destroy
    /// event per removed record.
    pub async fn destroy_connections(
        &self,
        filter: &ConnectionFilter,
    ) -> MeshResult<Vec<PeerConnectionRecord>> {
        let destroyed = self.store.destroy_connections(filter).await?;
        for record in &destroyed {
            tracing::debug!(
                connection = %record.id,
                initiator = %record.initiator,
                endpoint = %record.endpoint,
                "connection destroyed"
            );
            self.notifier
                .publish(ConnectionEvent::destroyed(record.clone()));
        }
        Ok(destroyed)
    }

    /// Remove every connection the peer initiated or terminates.
    pub async fn cascade_destroy(&self, peer_id: &PeerId) -> MeshResult<Vec<PeerConnectionRecord>> {
        let destroyed = self
            .destroy_connections(&ConnectionFilter::any().touching(peer_id.clone()))
            .await
            .inspect_err(|err| {
                tracing::warn!(peer = %peer_id, error = %err, "connection cascade failed");
            })?;
        tracing::debug!(
            peer = %peer_id,
            count = destroyed.len(),
            "cascaded connection removal"
        );
        Ok(destroyed)
    }

    async fn load_peer(&self, peer_id: &PeerId) -> MeshResult<Peer> {
        self.store
            .find_peer(peer_id)
            .await?
            .ok_or_else(|| MeshError::peer_not_found(peer_id))
    }

    async fn query(
        &self,
        base: ConnectionFilter,
        extra: Option<&ConnectionFilter>,
    ) -> MeshResult<Vec<PeerConnectionRecord>> {
        let filter = match extra {
            Some(extra) => base.merge(&without_direction(extra)),
            None => base,
        };
        Ok(self.store.find_connections(&filter).await?)
    }
}

/// Secondary criteria may narrow a directional query but never redirect it.
fn without_direction(extra: &ConnectionFilter) -> ConnectionFilter {
    ConnectionFilter {
        initiator: None,
        endpoint: None,
        ..extra.clone()
    }
}

#[async_trait]
impl LifecycleHooks for ConnectionGraph {
    async fn before_peer_destroy(&self, peer: &Peer) -> MeshResult<()> {
        self.cascade_destroy(&peer.id).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChannelId, ConnectionId, NewPeer};
    use crate::store::MemoryStore;

    fn edge(initiator: &PeerId, endpoint: &PeerId, state: ConnectionState) -> PeerConnectionRecord {
        PeerConnectionRecord {
            id: ConnectionId::generate(),
            initiator: initiator.clone(),
            endpoint: endpoint.clone(),
            state,
        }
    }

    async fn peer(store: &MemoryStore, socket: &str, broadcaster: bool) -> Peer {
        let mut new_peer = NewPeer::new(socket, ChannelId::from("lobby"));
        new_peer.broadcaster = broadcaster;
        store.create_peer(new_peer).await.unwrap()
    }

    #[tokio::test]
    async fn broadcaster_rebroadcasts_without_connections() {
        let store = MemoryStore::new();
        let caster = peer(&store, "caster", true).await;
        let viewer = peer(&store, "viewer", false).await;
        assert!(ConnectionGraph::can_rebroadcast(&caster));
        assert!(!ConnectionGraph::can_rebroadcast(&viewer));
    }

    #[tokio::test]
    async fn rebroadcast_requires_an_established_connection() {
        let store = MemoryStore::new();
        let graph = ConnectionGraph::new(store.clone(), Notifier::default());
        let up = peer(&store, "up", true).await;
        let down = peer(&store, "down", false).await;

        store.insert_connection(edge(&down.id, &up.id, ConnectionState::RecvEstablished));
        assert!(!graph.can_rebroadcast_by_peer_id(&down.id).await.unwrap());

        store.insert_connection(edge(&down.id, &up.id, ConnectionState::Established));
        assert!(graph.can_rebroadcast_by_peer_id(&down.id).await.unwrap());
    }

    #[tokio::test]
    async fn children_and_parents_are_opposite_directions() {
        let store = MemoryStore::new();
        let graph = ConnectionGraph::new(store.clone(), Notifier::default());
        let up = peer(&store, "up", true).await;
        let down = peer(&store, "down", false).await;
        let link = edge(&down.id, &up.id, ConnectionState::Established);
        store.insert_connection(link.clone());

        assert_eq!(graph.children_of(&up, None).await.unwrap(), vec![link.clone()]);
        assert!(graph.parents_of(&up, None).await.unwrap().is_empty());
        assert_eq!(graph.parents_of(&down, None).await.unwrap(), vec![link]);
        assert!(graph.children_of(&down, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn extra_criteria_narrow_by_state() {
        let store = MemoryStore::new();
        let graph = ConnectionGraph::new(store.clone(), Notifier::default());
        let up = peer(&store, "up", true).await;
        let a = peer(&store, "a", false).await;
        let b = peer(&store, "b", false).await;
        store.insert_connection(edge(&a.id, &up.id, ConnectionState::Established));
        store.insert_connection(edge(&b.id, &up.id, ConnectionState::Reserved));

        let established = graph
            .children_by_peer_id(&up.id, Some(&ConnectionFilter::established()))
            .await
            .unwrap();
        assert_eq!(established.len(), 1);
        assert_eq!(established[0].initiator, a.id);

        // Direction in the secondary filter is ignored.
        let redirected = graph
            .children_of(&up, Some(&ConnectionFilter::any().endpoint(a.id.clone())))
            .await
            .unwrap();
        assert_eq!(redirected.len(), 2);
    }

    #[tokio::test]
    async fn lookups_for_unknown_peer_are_not_found() {
        let graph = ConnectionGraph::new(MemoryStore::new(), Notifier::default());
        let err = graph
            .connections_by_peer_id(&PeerId::from("ghost"), None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn cascade_surfaces_store_failure() {
        let store = MemoryStore::new();
        let graph = ConnectionGraph::new(store.clone(), Notifier::default());
        store.set_failing(true);
        let err = graph.cascade_destroy(&PeerId::from("a")).await.unwrap_err();
        assert!(matches!(err, MeshError::Store(_)));
    }
}

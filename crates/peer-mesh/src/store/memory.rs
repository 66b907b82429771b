use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{ConnectionStore, StoreError};
use crate::model::{
    ChannelId, ConnectionFilter, ConnectionId, ConnectionState, NewPeer, Peer, PeerConnectionRecord,
    PeerId, Role,
};

#[derive(Debug, Clone)]
struct PeerRow {
    id: PeerId,
    socket_id: String,
    user: Option<String>,
    channel: ChannelId,
    broadcaster: bool,
}

/// In-memory store for tests and single-process wiring.
#[derive(Debug, Default)]
pub struct MemoryStore {
    peers: RwLock<Vec<PeerRow>>,
    connections: RwLock<Vec<PeerConnectionRecord>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// While set, every operation fails with [`StoreError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Insert a connection record as-is, bypassing reservation.
    pub fn insert_connection(&self, record: PeerConnectionRecord) {
        self.connections.write().push(record);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store is failing".into()))
        } else {
            Ok(())
        }
    }

    fn populate(&self, row: &PeerRow) -> Peer {
        let connections = self
            .connections
            .read()
            .iter()
            .filter(|record| record.initiator == row.id)
            .cloned()
            .collect();
        Peer {
            id: row.id.clone(),
            socket_id: row.socket_id.clone(),
            user: row.user.clone(),
            channel: row.channel.clone(),
            broadcaster: row.broadcaster,
            connections,
        }
    }
}

fn find_mut<'a>(
    connections: &'a mut [PeerConnectionRecord],
    id: &ConnectionId,
) -> Result<&'a mut PeerConnectionRecord, StoreError> {
    connections
        .iter_mut()
        .find(|record| &record.id == id)
        .ok_or_else(|| StoreError::Rejected(format!("connection {id} does not exist")))
}

#[async_trait]
impl ConnectionStore for MemoryStore {
    async fn create_peer(&self, peer: NewPeer) -> Result<Peer, StoreError> {
        self.check()?;
        let mut peers = self.peers.write();
        if peers.iter().any(|row| row.socket_id == peer.socket_id) {
            return Err(StoreError::Rejected(format!(
                "socket {} already has a peer",
                peer.socket_id
            )));
        }
        let row = PeerRow {
            id: PeerId::generate(),
            socket_id: peer.socket_id,
            user: peer.user,
            channel: peer.channel,
            broadcaster: peer.broadcaster,
        };
        peers.push(row.clone());
        drop(peers);
        Ok(self.populate(&row))
    }

    async fn find_peer(&self, id: &PeerId) -> Result<Option<Peer>, StoreError> {
        self.check()?;
        let row = self.peers.read().iter().find(|row| &row.id == id).cloned();
        Ok(row.map(|row| self.populate(&row)))
    }

    async fn list_peers(&self) -> Result<Vec<Peer>, StoreError> {
        self.check()?;
        let rows = self.peers.read().clone();
        Ok(rows.iter().map(|row| self.populate(row)).collect())
    }

    async fn destroy_peer(&self, id: &PeerId) -> Result<Option<Peer>, StoreError> {
        self.check()?;
        let row = {
            let mut peers = self.peers.write();
            let index = peers.iter().position(|row| &row.id == id);
            index.map(|index| peers.remove(index))
        };
        Ok(row.map(|row| self.populate(&row)))
    }

    async fn find_connections(
        &self,
        filter: &ConnectionFilter,
    ) -> Result<Vec<PeerConnectionRecord>, StoreError> {
        self.check()?;
        Ok(self
            .connections
            .read()
            .iter()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect())
    }

    async fn reserve_connection(
        &self,
        initiator: &PeerId,
        endpoint: &PeerId,
    ) -> Result<PeerConnectionRecord, StoreError> {
        self.check()?;
        if initiator == endpoint {
            return Err(StoreError::Rejected(
                "initiator and endpoint must differ".into(),
            ));
        }
        let record = PeerConnectionRecord {
            id: ConnectionId::generate(),
            initiator: initiator.clone(),
            endpoint: endpoint.clone(),
            state: ConnectionState::Reserved,
        };
        self.connections.write().push(record.clone());
        Ok(record)
    }

    async fn update_connection_state(
        &self,
        id: &ConnectionId,
        state: ConnectionState,
    ) -> Result<PeerConnectionRecord, StoreError> {
        self.check()?;
        let mut connections = self.connections.write();
        let record = find_mut(&mut connections, id)?;
        record.state = state;
        Ok(record.clone())
    }

    async fn transition_connection(
        &self,
        id: &ConnectionId,
        from: ConnectionState,
        to: ConnectionState,
    ) -> Result<Option<PeerConnectionRecord>, StoreError> {
        self.check()?;
        let mut connections = self.connections.write();
        let record = find_mut(&mut connections, id)?;
        if record.state != from {
            return Ok(None);
        }
        record.state = to;
        Ok(Some(record.clone()))
    }

    async fn finalize_connection(
        &self,
        id: &ConnectionId,
        role: Role,
    ) -> Result<PeerConnectionRecord, StoreError> {
        self.check()?;
        let mut connections = self.connections.write();
        let record = find_mut(&mut connections, id)?;
        record.state = record.state.finalize(role);
        Ok(record.clone())
    }

    async fn destroy_connections(
        &self,
        filter: &ConnectionFilter,
    ) -> Result<Vec<PeerConnectionRecord>, StoreError> {
        self.check()?;
        let mut connections = self.connections.write();
        let (removed, kept): (Vec<_>, Vec<_>) = connections
            .drain(..)
            .partition(|record| filter.matches(record));
        *connections = kept;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn populates_initiated_connections_only() {
        let store = MemoryStore::new();
        let channel = ChannelId::from("lobby");
        let a = store
            .create_peer(NewPeer::new("sock-a", channel.clone()))
            .await
            .unwrap();
        let b = store
            .create_peer(NewPeer::new("sock-b", channel))
            .await
            .unwrap();
        store.reserve_connection(&a.id, &b.id).await.unwrap();

        let a = store.find_peer(&a.id).await.unwrap().unwrap();
        let b = store.find_peer(&b.id).await.unwrap().unwrap();
        assert_eq!(a.connections.len(), 1);
        assert!(b.connections.is_empty());
    }

    #[tokio::test]
    async fn rejects_self_connection_and_duplicate_socket() {
        let store = MemoryStore::new();
        let a = store
            .create_peer(NewPeer::new("sock-a", "lobby".into()))
            .await
            .unwrap();
        assert!(matches!(
            store.reserve_connection(&a.id, &a.id).await,
            Err(StoreError::Rejected(_))
        ));
        assert!(
            store
                .create_peer(NewPeer::new("sock-a", "lobby".into()))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn finalize_walks_both_halves() {
        let store = MemoryStore::new();
        let record = store
            .reserve_connection(&"a".into(), &"b".into())
            .await
            .unwrap();
        let first = store
            .finalize_connection(&record.id, Role::Receiver)
            .await
            .unwrap();
        assert_eq!(first.state, ConnectionState::RecvEstablished);
        let second = store
            .finalize_connection(&record.id, Role::Initiator)
            .await
            .unwrap();
        assert_eq!(second.state, ConnectionState::Established);
    }

    #[tokio::test]
    async fn transition_only_applies_from_the_expected_state() {
        let store = MemoryStore::new();
        let record = store
            .reserve_connection(&"a".into(), &"b".into())
            .await
            .unwrap();
        store
            .finalize_connection(&record.id, Role::Initiator)
            .await
            .unwrap();

        let applied = store
            .transition_connection(
                &record.id,
                ConnectionState::Reserved,
                ConnectionState::Connecting,
            )
            .await
            .unwrap();
        assert!(applied.is_none());
        let stored = store
            .find_connections(&ConnectionFilter::by_id(record.id.clone()))
            .await
            .unwrap();
        assert_eq!(stored[0].state, ConnectionState::InitEstablished);

        let unknown = store
            .transition_connection(
                &ConnectionId::generate(),
                ConnectionState::Reserved,
                ConnectionState::Connecting,
            )
            .await;
        assert!(matches!(unknown, Err(StoreError::Rejected(_))));
    }

    #[tokio::test]
    async fn destroy_returns_removed_records() {
        let store = MemoryStore::new();
        let keep = store
            .reserve_connection(&"a".into(), &"b".into())
            .await
            .unwrap();
        let gone = store
            .reserve_connection(&"c".into(), &"d".into())
            .await
            .unwrap();
        let removed = store
            .destroy_connections(&ConnectionFilter::any().touching("d".into()))
            .await
            .unwrap();
        assert_eq!(removed, vec![gone]);
        assert_eq!(
            store.find_connections(&ConnectionFilter::any()).await.unwrap(),
            vec![keep]
        );
    }

    #[tokio::test]
    async fn failing_switch_rejects_everything() {
        let store = MemoryStore::new();
        store.set_failing(true);
        assert!(matches!(
            store.list_peers().await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_failing(false);
        assert!(store.list_peers().await.unwrap().is_empty());
    }
}

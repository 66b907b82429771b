use std::collections::HashSet;
use std::sync::Arc;

use peer_mesh::model::{ChannelId, ConnectionFilter, ConnectionId, ConnectionState, NewPeer, Peer};
use peer_mesh::{
    ConnectionEvent, ConnectionGraph, ConnectionStore, MeshConfig, MeshContext, MemoryStore,
    PeerConnectionRecord, PeerDirectory, TreeBuilder,
};

struct Mesh {
    store: Arc<MemoryStore>,
    ctx: MeshContext,
    directory: PeerDirectory,
}

impl Mesh {
    fn new() -> Self {
        let store = MemoryStore::new();
        let ctx = MeshContext::new(store.clone(), MeshConfig::localhost()).with_cascade();
        let directory = PeerDirectory::new(ctx.clone());
        Self {
            store,
            ctx,
            directory,
        }
    }

    async fn join(&self, socket: &str, channel: &str, broadcaster: bool) -> Peer {
        let mut peer = NewPeer::new(socket, ChannelId::from(channel));
        peer.broadcaster = broadcaster;
        self.directory.join(peer).await.unwrap()
    }

    /// `from` dials `to` and the record is moved to `state`.
    async fn link(&self, from: &Peer, to: &Peer, state: ConnectionState) -> PeerConnectionRecord {
        let record = self.store.reserve_connection(&from.id, &to.id).await.unwrap();
        self.store
            .update_connection_state(&record.id, state)
            .await
            .unwrap()
    }
}

fn names(ids: &[peer_mesh::PeerId], peers: &[&Peer]) -> Vec<String> {
    ids.iter()
        .map(|id| {
            peers
                .iter()
                .find(|peer| &peer.id == id)
                .map(|peer| peer.socket_id.clone())
                .unwrap_or_else(|| id.to_string())
        })
        .collect()
}

#[tokio::test]
async fn rebroadcast_follows_broadcaster_flag_or_established_links() {
    let mesh = Mesh::new();
    let graph = mesh.ctx.graph();
    let caster = mesh.join("caster", "lobby", true).await;
    let relay = mesh.join("relay", "lobby", false).await;
    let pending = mesh.join("pending", "lobby", false).await;
    mesh.link(&relay, &caster, ConnectionState::Established).await;
    mesh.link(&pending, &relay, ConnectionState::InitEstablished).await;

    assert!(graph.can_rebroadcast_by_peer_id(&caster.id).await.unwrap());
    assert!(graph.can_rebroadcast_by_peer_id(&relay.id).await.unwrap());
    assert!(!graph.can_rebroadcast_by_peer_id(&pending.id).await.unwrap());

    let reloaded = mesh.store.find_peer(&relay.id).await.unwrap().unwrap();
    assert!(ConnectionGraph::can_rebroadcast(&reloaded));
}

#[tokio::test]
async fn children_and_parents_by_peer_id() {
    let mesh = Mesh::new();
    let graph = mesh.ctx.graph();
    let caster = mesh.join("caster", "lobby", true).await;
    let relay = mesh.join("relay", "lobby", false).await;
    let leaf = mesh.join("leaf", "lobby", false).await;
    let up = mesh.link(&relay, &caster, ConnectionState::Established).await;
    let down = mesh.link(&leaf, &relay, ConnectionState::Reserved).await;

    assert_eq!(
        graph.children_by_peer_id(&relay.id, None).await.unwrap(),
        vec![down.clone()]
    );
    assert_eq!(
        graph.parents_by_peer_id(&relay.id, None).await.unwrap(),
        vec![up.clone()]
    );
    assert!(
        graph
            .children_by_peer_id(&relay.id, Some(&ConnectionFilter::established()))
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(
        graph
            .connections_by_peer_id(&relay.id, Some(&ConnectionFilter::established()))
            .await
            .unwrap(),
        vec![up]
    );
}

#[tokio::test]
async fn leaving_cascades_exactly_once_per_touching_connection() {
    let mesh = Mesh::new();
    let mut notifications = mesh.ctx.notifier.subscribe();
    let caster = mesh.join("caster", "lobby", true).await;
    let relay = mesh.join("relay", "lobby", false).await;
    let leaf = mesh.join("leaf", "lobby", false).await;
    let upstream = mesh.link(&relay, &caster, ConnectionState::Established).await;
    let downstream = mesh.link(&leaf, &relay, ConnectionState::Established).await;
    let bypass = mesh.link(&leaf, &caster, ConnectionState::Reserved).await;

    let removed = mesh.directory.leave(&relay.id).await.unwrap();
    assert_eq!(removed.id, relay.id);
    assert!(mesh.store.find_peer(&relay.id).await.unwrap().is_none());

    let mut destroyed: Vec<ConnectionId> = Vec::new();
    while let Ok(event) = notifications.try_recv() {
        match event {
            ConnectionEvent::Destroyed { id, previous } => {
                assert!(previous.touches(&relay.id));
                destroyed.push(id);
            }
            other => panic!("unexpected notification {other:?}"),
        }
    }
    let unique: HashSet<&ConnectionId> = destroyed.iter().collect();
    assert_eq!(destroyed.len(), 2);
    assert_eq!(
        unique,
        HashSet::from([&upstream.id, &downstream.id])
    );

    let left = mesh
        .store
        .find_connections(&ConnectionFilter::any())
        .await
        .unwrap();
    assert_eq!(left, vec![bypass]);
}

#[tokio::test]
async fn unavailable_store_keeps_the_peer() {
    let mesh = Mesh::new();
    let caster = mesh.join("caster", "lobby", true).await;
    let relay = mesh.join("relay", "lobby", false).await;
    mesh.link(&relay, &caster, ConnectionState::Established).await;

    mesh.store.set_failing(true);
    assert!(mesh.directory.leave(&relay.id).await.is_err());
    mesh.store.set_failing(false);
    assert!(mesh.store.find_peer(&relay.id).await.unwrap().is_some());
    assert_eq!(mesh.store.connection_count(), 1);
}

#[tokio::test]
async fn tree_follows_qualifying_links_within_the_channel() {
    let mesh = Mesh::new();
    let a = mesh.join("a", "lobby", true).await;
    let b = mesh.join("b", "lobby", false).await;
    let c = mesh.join("c", "lobby", false).await;
    let d = mesh.join("d", "elsewhere", false).await;
    let e = mesh.join("e", "lobby", false).await;
    mesh.link(&b, &a, ConnectionState::Established).await;
    mesh.link(&c, &b, ConnectionState::Established).await;
    mesh.link(&d, &a, ConnectionState::Established).await;
    mesh.link(&e, &c, ConnectionState::Reserved).await;
    let peers = [&a, &b, &c, &d, &e];

    let builder = TreeBuilder::new(mesh.store.clone());
    let tree = builder.build(&a.id).await.unwrap();
    assert_eq!(names(&tree.peer_ids(), &peers), vec!["a", "b", "c"]);
    assert_eq!(tree.children.len(), 1);
    assert_eq!(tree.children[0].children[0].id, c.id);
    assert!(tree.broadcaster);

    let relaxed = builder
        .build_with(&a.id, &ConnectionFilter::any())
        .await
        .unwrap();
    assert_eq!(names(&relaxed.peer_ids(), &peers), vec!["a", "b", "c", "e"]);
    assert!(relaxed.find(&d.id).is_none());
}

#[tokio::test]
async fn tree_for_unknown_root_is_not_found() {
    let mesh = Mesh::new();
    let err = TreeBuilder::new(mesh.store.clone())
        .build(&peer_mesh::PeerId::from("ghost"))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn tree_snapshot_serializes() {
    let mesh = Mesh::new();
    let a = mesh.join("a", "lobby", true).await;
    let b = mesh.join("b", "lobby", false).await;
    mesh.link(&b, &a, ConnectionState::Established).await;

    let tree = TreeBuilder::new(mesh.store.clone()).build(&a.id).await.unwrap();
    let value = serde_json::to_value(&tree).unwrap();
    assert_eq!(value["socket_id"], "a");
    assert_eq!(value["broadcaster"], true);
    assert_eq!(value["children"][0]["socket_id"], "b");
}

//! Rebroadcast tree snapshots.
//!
//! The tree is a breadth-first expansion from a root peer over qualifying
//! connections within the root's channel. A peer joins the tree under the
//! first parent reached whose id is the endpoint of one of the peer's own
//! connections. Components not reachable from the root are left out.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use serde::Serialize;

use crate::error::{MeshError, MeshResult};
use crate::model::{ChannelId, ConnectionFilter, Peer, PeerId};
use crate::store::ConnectionStore;

/// One node of a rebroadcast tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeNode {
    pub id: PeerId,
    pub socket_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub channel: ChannelId,
    pub broadcaster: bool,
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    fn leaf(peer: &Peer) -> Self {
        Self {
            id: peer.id.clone(),
            socket_id: peer.socket_id.clone(),
            user: peer.user.clone(),
            channel: peer.channel.clone(),
            broadcaster: peer.broadcaster,
            children: Vec::new(),
        }
    }

    /// Every peer id in breadth-first order, root first.
    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids = Vec::new();
        let mut queue = VecDeque::from([self]);
        while let Some(node) = queue.pop_front() {
            ids.push(node.id.clone());
            queue.extend(node.children.iter());
        }
        ids
    }

    pub fn find(&self, id: &PeerId) -> Option<&TreeNode> {
        if &self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(id))
    }
}

#[derive(Clone)]
pub struct TreeBuilder {
    store: Arc<dyn ConnectionStore>,
}

impl TreeBuilder {
    pub fn new(store: Arc<dyn ConnectionStore>) -> Self {
        Self { store }
    }

    /// Build with the default filter (established connections only).
    pub async fn build(&self, root: &PeerId) -> MeshResult<TreeNode> {
        self.build_with(root, &ConnectionFilter::established()).await
    }

    pub async fn build_with(&self, root: &PeerId, filter: &ConnectionFilter) -> MeshResult<TreeNode> {
        let root_peer = self
            .store
            .find_peer(root)
            .await?
            .ok_or_else(|| MeshError::peer_not_found(root))?;
        let peers = self.store.list_peers().await?;
        Ok(expand(&root_peer, &peers, filter))
    }
}

/// Breadth-first expansion over an already loaded peer set.
pub fn expand(root: &Peer, peers: &[Peer], filter: &ConnectionFilter) -> TreeNode {
    let candidates: Vec<&Peer> = peers
        .iter()
        .filter(|peer| peer.id != root.id && peer.channel == root.channel)
        .collect();

    let mut visited: HashSet<&PeerId> = HashSet::from([&root.id]);
    // children[i] lists candidate indices attached under node i; node 0 is
    // the root and candidate k is node k + 1.
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); candidates.len() + 1];
    let mut queue: VecDeque<(usize, &PeerId)> = VecDeque::from([(0, &root.id)]);

    while let Some((parent_node, parent_id)) = queue.pop_front() {
        for (index, candidate) in candidates.iter().enumerate() {
            if visited.contains(&candidate.id) {
                continue;
            }
            let attached = candidate
                .connections
                .iter()
                .any(|record| &record.endpoint == parent_id && filter.matches(record));
            if attached {
                visited.insert(&candidate.id);
                children[parent_node].push(index + 1);
                queue.push_back((index + 1, &candidate.id));
            }
        }
    }

    assemble(0, root, &candidates, &children)
}

fn assemble(node: usize, peer: &Peer, candidates: &[&Peer], children: &[Vec<usize>]) -> TreeNode {
    let mut tree = TreeNode::leaf(peer);
    tree.children = children[node]
        .iter()
        .map(|&child| assemble(child, candidates[child - 1], candidates, children))
        .collect();
    tree
}

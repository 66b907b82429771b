//! Lifecycle hooks and the injected collaborators they run against.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::MeshConfig;
use crate::error::{MeshError, MeshResult};
use crate::graph::ConnectionGraph;
use crate::model::{NewPeer, Peer, PeerConnectionRecord, PeerId};
use crate::notify::{ConnectionEvent, Notifier};
use crate::store::ConnectionStore;

/// Callback slots invoked at defined points of a record's life. Returning
/// is the completion signal; an `Err` from a `before_*` slot aborts the
/// operation.
#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    async fn before_peer_destroy(&self, _peer: &Peer) -> MeshResult<()> {
        Ok(())
    }

    async fn after_peer_destroy(&self, _peer: &Peer) -> MeshResult<()> {
        Ok(())
    }

    async fn after_connection_update(
        &self,
        _previous: &PeerConnectionRecord,
        _current: &PeerConnectionRecord,
    ) -> MeshResult<()> {
        Ok(())
    }
}

/// Store, notifier, configuration and registered hooks, handed to every
/// component at construction.
#[derive(Clone)]
pub struct MeshContext {
    pub store: Arc<dyn ConnectionStore>,
    pub notifier: Notifier,
    pub config: MeshConfig,
    hooks: Vec<Arc<dyn LifecycleHooks>>,
}

impl MeshContext {
    pub fn new(store: Arc<dyn ConnectionStore>, config: MeshConfig) -> Self {
        let notifier = Notifier::new(config.notify_capacity);
        Self {
            store,
            notifier,
            config,
            hooks: Vec::new(),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn LifecycleHooks>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Register the connection graph so that removing a peer removes every
    /// connection touching it.
    pub fn with_cascade(self) -> Self {
        let graph = self.graph();
        self.with_hook(Arc::new(graph))
    }

    pub fn graph(&self) -> ConnectionGraph {
        ConnectionGraph::new(self.store.clone(), self.notifier.clone())
    }

    pub fn hooks(&self) -> &[Arc<dyn LifecycleHooks>] {
        &self.hooks
    }

    /// Publish the update and run every `after_connection_update` slot.
    pub async fn connection_updated(
        &self,
        previous: PeerConnectionRecord,
        current: PeerConnectionRecord,
    ) -> MeshResult<()> {
        for hook in &self.hooks {
            hook.after_connection_update(&previous, &current).await?;
        }
        self.notifier.publish(ConnectionEvent::Updated {
            id: current.id.clone(),
            previous,
            current,
        });
        Ok(())
    }
}

/// Peer registration and removal with hooks applied.
#[derive(Clone)]
pub struct PeerDirectory {
    ctx: MeshContext,
}

impl PeerDirectory {
    pub fn new(ctx: MeshContext) -> Self {
        Self { ctx }
    }

    pub async fn join(&self, peer: NewPeer) -> MeshResult<Peer> {
        let peer = self.ctx.store.create_peer(peer).await?;
        tracing::info!(
            peer = %peer.id,
            channel = %peer.channel,
            broadcaster = peer.broadcaster,
            "peer joined"
        );
        Ok(peer)
    }

    /// Remove a peer. Every `before_peer_destroy` hook runs first; the first
    /// failure aborts the removal and is returned. Once the record is gone
    /// every `after_peer_destroy` hook runs even if an earlier one failed,
    /// and the first such failure is returned afterwards.
    pub async fn leave(&self, id: &PeerId) -> MeshResult<Peer> {
        let peer = self
            .ctx
            .store
            .find_peer(id)
            .await?
            .ok_or_else(|| MeshError::peer_not_found(id))?;

        for hook in self.ctx.hooks() {
            if let Err(err) = hook.before_peer_destroy(&peer).await {
                tracing::warn!(peer = %id, error = %err, "before_peer_destroy hook failed");
                return Err(err);
            }
        }

        let removed = self
            .ctx
            .store
            .destroy_peer(id)
            .await?
            .ok_or_else(|| MeshError::peer_not_found(id))?;

        let mut first_err = None;
        for hook in self.ctx.hooks() {
            if let Err(err) = hook.after_peer_destroy(&removed).await {
                tracing::warn!(peer = %id, error = %err, "after_peer_destroy hook failed");
                first_err.get_or_insert(err);
            }
        }
        tracing::info!(peer = %id, "peer left");
        match first_err {
            Some(err) => Err(err),
            None => Ok(removed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChannelId;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHook {
        before: AtomicUsize,
        after: AtomicUsize,
        refuse: bool,
        fail_after: bool,
    }

    #[async_trait]
    impl LifecycleHooks for CountingHook {
        async fn before_peer_destroy(&self, _peer: &Peer) -> MeshResult<()> {
            self.before.fetch_add(1, Ordering::SeqCst);
            if self.refuse {
                return Err(MeshError::Hook("refused".into()));
            }
            Ok(())
        }

        async fn after_peer_destroy(&self, _peer: &Peer) -> MeshResult<()> {
            self.after.fetch_add(1, Ordering::SeqCst);
            if self.fail_after {
                return Err(MeshError::Hook("cleanup failed".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn hooks_complete_exactly_once_per_leave() {
        let store = MemoryStore::new();
        let hook = Arc::new(CountingHook::default());
        let ctx = MeshContext::new(store.clone(), MeshConfig::default()).with_hook(hook.clone());
        let directory = PeerDirectory::new(ctx);
        let peer = directory
            .join(NewPeer::new("sock", ChannelId::from("lobby")))
            .await
            .unwrap();

        directory.leave(&peer.id).await.unwrap();
        assert_eq!(hook.before.load(Ordering::SeqCst), 1);
        assert_eq!(hook.after.load(Ordering::SeqCst), 1);
        assert!(store.find_peer(&peer.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn refusing_hook_keeps_the_peer() {
        let store = MemoryStore::new();
        let hook = Arc::new(CountingHook {
            refuse: true,
            ..CountingHook::default()
        });
        let ctx = MeshContext::new(store.clone(), MeshConfig::default()).with_hook(hook.clone());
        let directory = PeerDirectory::new(ctx);
        let peer = directory
            .join(NewPeer::new("sock", ChannelId::from("lobby")))
            .await
            .unwrap();

        let err = directory.leave(&peer.id).await.unwrap_err();
        assert!(matches!(err, MeshError::Hook(_)));
        assert_eq!(hook.after.load(Ordering::SeqCst), 0);
        assert!(store.find_peer(&peer.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failing_after_hook_does_not_skip_later_hooks() {
        let store = MemoryStore::new();
        let failing = Arc::new(CountingHook {
            fail_after: true,
            ..CountingHook::default()
        });
        let counting = Arc::new(CountingHook::default());
        let ctx = MeshContext::new(store.clone(), MeshConfig::default())
            .with_hook(failing.clone())
            .with_hook(counting.clone());
        let directory = PeerDirectory::new(ctx);
        let peer = directory
            .join(NewPeer::new("sock", ChannelId::from("lobby")))
            .await
            .unwrap();

        let err = directory.leave(&peer.id).await.unwrap_err();
        assert!(matches!(err, MeshError::Hook(_)));
        assert_eq!(failing.after.load(Ordering::SeqCst), 1);
        assert_eq!(counting.before.load(Ordering::SeqCst), 1);
        assert_eq!(counting.after.load(Ordering::SeqCst), 1);
        assert!(store.find_peer(&peer.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn leaving_unknown_peer_is_not_found() {
        let ctx = MeshContext::new(MemoryStore::new(), MeshConfig::default());
        let err = PeerDirectory::new(ctx)
            .leave(&PeerId::from("ghost"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}

//! Plugin registry.
//!
//! Maps identities to live lifetimes on this node and resolves identities
//! hosted elsewhere through the running-location mapping. Resolution is
//! two-tier: the local map is authoritative, the cluster mapping is
//! advisory and only consulted on a local miss.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{PluginError, PluginLifetime, PluginResult, PluginUniqueIdentifier, RunningLocation};
use crate::cluster::{ClusterAnnouncer, RunningLocationMap};
use crate::runtime::{InvocationGateway, RemoteLifetime};

/// Outcome of a successful lookup.
#[derive(Clone)]
pub enum Resolved {
    /// Hosted (or deployed) by this node.
    Local(Arc<dyn PluginLifetime>),
    /// Hosted elsewhere; invocations are forwarded.
    Remote(Arc<dyn PluginLifetime>),
}

impl Resolved {
    pub fn lifetime(&self) -> &Arc<dyn PluginLifetime> {
        match self {
            Self::Local(lifetime) | Self::Remote(lifetime) => lifetime,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

impl std::fmt::Debug for Resolved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_local() { "Local" } else { "Remote" };
        f.debug_tuple(kind).field(&self.lifetime().identity().as_str()).finish()
    }
}

/// A registered plugin, for listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub identity: PluginUniqueIdentifier,
    pub location: RunningLocation,
}

type LocalMap = DashMap<PluginUniqueIdentifier, Arc<dyn PluginLifetime>>;

/// Registry of running plugins.
#[derive(Clone)]
pub struct PluginRegistry {
    local: Arc<LocalMap>,
    mapping: Arc<RunningLocationMap>,
    announcer: ClusterAnnouncer,
    gateway: Arc<dyn InvocationGateway>,
}

impl PluginRegistry {
    pub fn new(
        mapping: Arc<RunningLocationMap>,
        announcer: ClusterAnnouncer,
        gateway: Arc<dyn InvocationGateway>,
    ) -> Self {
        Self { local: Arc::new(DashMap::new()), mapping, announcer, gateway }
    }

    fn node_id(&self) -> &str {
        &self.announcer.node().node_id
    }

    /// Take ownership of a lifetime and publish it to the cluster.
    ///
    /// Fails with `DuplicateIdentity` if the identity is already registered
    /// on this node; the caller keeps the rejected lifetime.
    pub async fn register(&self, lifetime: Arc<dyn PluginLifetime>) -> PluginResult<()> {
        let identity = lifetime.identity().clone();

        match self.local.entry(identity.clone()) {
            Entry::Occupied(_) => return Err(PluginError::DuplicateIdentity(identity)),
            Entry::Vacant(slot) => {
                slot.insert(lifetime.clone());
            }
        }

        let location = lifetime.location();
        self.mapping.upsert(identity.clone(), location.clone());
        if let Err(e) = self.announcer.announce(&identity, &location).await {
            tracing::warn!(identity = %identity, error = %e, "Failed to announce plugin");
        }
        tracing::info!(identity = %identity, runtime = %lifetime.runtime(), "Plugin registered");

        self.watch_termination(lifetime);
        Ok(())
    }

    // Drop the entry when the backend dies on its own.
    fn watch_termination(&self, lifetime: Arc<dyn PluginLifetime>) {
        let registry = self.clone();
        tokio::spawn(async move {
            lifetime.closed().await;

            let identity = lifetime.identity().clone();
            let removed = registry
                .local
                .remove_if(&identity, |_, current| Arc::ptr_eq(current, &lifetime))
                .is_some();
            if !removed {
                return;
            }

            tracing::warn!(identity = %identity, "Plugin backend terminated");
            registry.forget(&identity).await;
        });
    }

    async fn forget(&self, identity: &PluginUniqueIdentifier) {
        if self.mapping.get(identity).is_some_and(|e| e.location.node_id == self.node_id()) {
            self.mapping.remove(identity);
        }
        if let Err(e) = self.announcer.withdraw(identity).await {
            tracing::warn!(identity = %identity, error = %e, "Failed to withdraw plugin");
        }
    }

    /// Resolve an identity.
    ///
    /// 1. The local map.
    /// 2. A fresh mapping entry for another node.
    /// 3. The store itself, refreshing the mapping.
    ///
    /// Entries that claim this node but are missing locally are stale and
    /// ignored. Never provisions anything.
    pub async fn lookup(&self, identity: &PluginUniqueIdentifier) -> Option<Resolved> {
        if let Some(lifetime) = self.get_local(identity) {
            return Some(Resolved::Local(lifetime));
        }

        if let Some(location) = self.mapping.get_fresh(identity) {
            if location.node_id != self.node_id() {
                return Some(self.remote(identity, location));
            }
        }

        match self.announcer.fetch(identity).await {
            Ok(Some(location)) => {
                self.mapping.upsert(identity.clone(), location.clone());
                if location.node_id == self.node_id() {
                    return None;
                }
                Some(self.remote(identity, location))
            }
            Ok(None) => {
                self.mapping.remove(identity);
                None
            }
            Err(e) => {
                tracing::warn!(identity = %identity, error = %e, "Cluster lookup failed");
                None
            }
        }
    }

    fn remote(&self, identity: &PluginUniqueIdentifier, location: RunningLocation) -> Resolved {
        tracing::debug!(identity = %identity, node = %location.node_id, "Routing to remote plugin");
        Resolved::Remote(Arc::new(RemoteLifetime::new(
            identity.clone(),
            location,
            self.gateway.clone(),
        )))
    }

    /// The local lifetime for an identity, if this node hosts it.
    pub fn get_local(&self, identity: &PluginUniqueIdentifier) -> Option<Arc<dyn PluginLifetime>> {
        self.local.get(identity).map(|entry| entry.value().clone())
    }

    /// Unregister a plugin and shut its backend down.
    pub async fn remove(&self, identity: &PluginUniqueIdentifier) -> PluginResult<()> {
        let (_, lifetime) =
            self.local.remove(identity).ok_or_else(|| PluginError::NotFound(identity.clone()))?;

        self.forget(identity).await;
        tracing::info!(identity = %identity, "Plugin removed");
        lifetime.shutdown().await
    }

    /// Every plugin hosted by this node.
    pub fn list(&self) -> Vec<RegistryEntry> {
        let mut entries: Vec<_> = self
            .local
            .iter()
            .map(|e| RegistryEntry { identity: e.key().clone(), location: e.value().location() })
            .collect();
        entries.sort_by(|a, b| a.identity.cmp(&b.identity));
        entries
    }

    pub fn len(&self) -> usize {
        self.local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }

    pub fn contains(&self, identity: &PluginUniqueIdentifier) -> bool {
        self.local.contains_key(identity)
    }

    /// Re-announce every local plugin; returns how many announcements failed.
    pub async fn heartbeat(&self) -> usize {
        let entries = self.list();
        let mut failures = 0;
        for entry in entries {
            self.mapping.upsert(entry.identity.clone(), entry.location.clone());
            if let Err(e) = self.announcer.announce(&entry.identity, &entry.location).await {
                tracing::debug!(identity = %entry.identity, error = %e, "Heartbeat announce failed");
                failures += 1;
            }
        }
        failures
    }

    /// Remove and shut down every local plugin.
    pub async fn shutdown_all(&self) {
        let identities: Vec<_> = self.local.iter().map(|e| e.key().clone()).collect();
        for identity in identities {
            if let Err(e) = self.remove(&identity).await {
                tracing::warn!(identity = %identity, error = %e, "Failed to stop plugin");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::watch;

    use super::*;
    use crate::cluster::{running_key, CoordinationStore, MemoryStore, NodeInfo};
    use crate::plugin::{EventStream, InvokeRequest, RuntimeKind};

    struct StubLifetime {
        identity: PluginUniqueIdentifier,
        location: RunningLocation,
        stopped: watch::Sender<bool>,
    }

    impl StubLifetime {
        fn new(identity: PluginUniqueIdentifier, node: &NodeInfo) -> Arc<Self> {
            let (stopped, _) = watch::channel(false);
            Arc::new(Self { identity, location: node.location(RuntimeKind::Local, "pid:1"), stopped })
        }
    }

    #[async_trait]
    impl PluginLifetime for StubLifetime {
        fn identity(&self) -> &PluginUniqueIdentifier {
            &self.identity
        }

        fn runtime(&self) -> RuntimeKind {
            RuntimeKind::Local
        }

        fn location(&self) -> RunningLocation {
            self.location.clone()
        }

        async fn invoke(&self, _request: InvokeRequest) -> PluginResult<EventStream> {
            Err(PluginError::Invocation("stub".into()))
        }

        async fn shutdown(&self) -> PluginResult<()> {
            self.stopped.send_replace(true);
            Ok(())
        }

        async fn closed(&self) {
            let _ = self.stopped.subscribe().wait_for(|s| *s).await;
        }
    }

    struct NoGateway;

    #[async_trait]
    impl InvocationGateway for NoGateway {
        async fn invoke(
            &self,
            identity: &PluginUniqueIdentifier,
            _location: &RunningLocation,
            _request: InvokeRequest,
        ) -> PluginResult<EventStream> {
            Err(PluginError::NotFound(identity.clone()))
        }
    }

    fn id(name: &str) -> PluginUniqueIdentifier {
        PluginUniqueIdentifier::new(Some("acme"), name, "1.0.0", "cafe").unwrap()
    }

    fn registry(store: &Arc<MemoryStore>, node: &str, stale_after: Duration) -> PluginRegistry {
        let node = NodeInfo::new(node, format!("http://{node}"));
        PluginRegistry::new(
            Arc::new(RunningLocationMap::new(stale_after)),
            ClusterAnnouncer::new(store.clone(), node),
            Arc::new(NoGateway),
        )
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_register_and_lookup_local() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store, "a", Duration::from_secs(60));
        let node = registry.announcer.node().clone();

        registry.register(StubLifetime::new(id("x"), &node)).await.unwrap();

        let resolved = registry.lookup(&id("x")).await.unwrap();
        assert!(resolved.is_local());
        assert!(store.get(&running_key(&id("x"))).await.unwrap().is_some());
        assert_eq!(registry.list().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_register_rejected() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store, "a", Duration::from_secs(60));
        let node = registry.announcer.node().clone();

        registry.register(StubLifetime::new(id("x"), &node)).await.unwrap();
        let err = registry.register(StubLifetime::new(id("x"), &node)).await.unwrap_err();

        assert!(matches!(err, PluginError::DuplicateIdentity(_)));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_register_admits_one() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store, "a", Duration::from_secs(60));
        let node = registry.announcer.node().clone();

        let attempts = (0..16).map(|_| {
            let registry = registry.clone();
            let lifetime = StubLifetime::new(id("x"), &node);
            tokio::spawn(async move { registry.register(lifetime).await })
        });
        let results = futures::future::join_all(attempts).await;

        let mut admitted = 0;
        let mut rejected = 0;
        for result in results {
            match result.unwrap() {
                Ok(()) => admitted += 1,
                Err(PluginError::DuplicateIdentity(identity)) => {
                    assert_eq!(identity, id("x"));
                    rejected += 1;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(rejected, 15);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_lookup_routes_to_other_node() {
        let store = Arc::new(MemoryStore::new());
        let a = registry(&store, "a", Duration::from_secs(60));
        let b = registry(&store, "b", Duration::from_secs(60));
        let node_b = b.announcer.node().clone();

        b.register(StubLifetime::new(id("x"), &node_b)).await.unwrap();

        // Node a has never seen a notification: resolved via the store.
        let resolved = a.lookup(&id("x")).await.unwrap();
        assert!(!resolved.is_local());
        assert_eq!(resolved.lifetime().runtime(), RuntimeKind::Remote);
        assert_eq!(resolved.lifetime().location().node_id, "b");

        // And now from the refreshed mapping.
        assert!(a.mapping.get_fresh(&id("x")).is_some());
        assert!(a.lookup(&id("x")).await.is_some());
    }

    #[tokio::test]
    async fn test_lookup_unknown_and_stale_self_entries() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store, "a", Duration::from_secs(60));
        assert!(registry.lookup(&id("nothing")).await.is_none());

        // An entry claiming this node without a local lifetime is ignored.
        let node = registry.announcer.node().clone();
        registry.mapping.upsert(id("ghost"), node.location(RuntimeKind::Local, "pid:9"));
        assert!(registry.lookup(&id("ghost")).await.is_none());
    }

    #[tokio::test]
    async fn test_remove_shuts_down_and_withdraws() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store, "a", Duration::from_secs(60));
        let node = registry.announcer.node().clone();
        let lifetime = StubLifetime::new(id("x"), &node);

        registry.register(lifetime.clone()).await.unwrap();
        registry.remove(&id("x")).await.unwrap();

        assert!(*lifetime.stopped.borrow());
        assert!(store.get(&running_key(&id("x"))).await.unwrap().is_none());
        assert!(matches!(registry.remove(&id("x")).await, Err(PluginError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_terminated_backend_is_dropped() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store, "a", Duration::from_secs(60));
        let node = registry.announcer.node().clone();
        let lifetime = StubLifetime::new(id("x"), &node);

        registry.register(lifetime.clone()).await.unwrap();
        lifetime.stopped.send_replace(true);

        wait_until(|| !registry.contains(&id("x"))).await;
        let key = running_key(&id("x"));
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.get(&key).await.unwrap().is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_restores_entries() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store, "a", Duration::from_secs(60));
        let node = registry.announcer.node().clone();
        registry.register(StubLifetime::new(id("x"), &node)).await.unwrap();

        store.delete(&running_key(&id("x"))).await.unwrap();
        assert_eq!(registry.heartbeat().await, 0);
        assert!(store.get(&running_key(&id("x"))).await.unwrap().is_some());
    }
}

//! Daemon context.
//!
//! Every shared component is constructed exactly once here and handed to
//! the pieces that need it. There are no process-wide singletons.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::cluster::{
    connect_store, ClusterAnnouncer, CoordinationStore, DistributedLock, LocalWatcher, NodeInfo,
    RemoteWatcher, RunningLocationMap, Shutdown,
};
use crate::core::{Config, Platform, RetryConfig};
use crate::media::MediaManager;
use crate::plugin::{
    EventStream, InstallPipeline, InstallSettings, InvokeRequest, ManifestDecoder,
    PackageDecoder, PackageDescriptor, PluginError, PluginRegistry, PluginResult,
    PluginUniqueIdentifier, Resolved,
};
use crate::runtime::{build_backend, HttpGateway, InvocationGateway, RuntimeBackend};

/// Shared state of one daemon node.
pub struct DaemonContext {
    config: Config,
    node: NodeInfo,
    store: Arc<dyn CoordinationStore>,
    mapping: Arc<RunningLocationMap>,
    announcer: ClusterAnnouncer,
    registry: PluginRegistry,
    backend: Arc<dyn RuntimeBackend>,
    media: Arc<MediaManager>,
    pipeline: InstallPipeline,
}

impl DaemonContext {
    /// Connect to the configured store and build the context.
    pub async fn connect(config: Config) -> PluginResult<Arc<Self>> {
        let store = connect_store(&config.coordination)?;
        Self::build(config, store, Arc::new(ManifestDecoder)).await
    }

    /// Build the context on an existing store.
    ///
    /// Fails if the configuration is invalid or the store cannot be reached.
    pub async fn build(
        config: Config,
        store: Arc<dyn CoordinationStore>,
        decoder: Arc<dyn PackageDecoder>,
    ) -> PluginResult<Arc<Self>> {
        config.validate()?;

        if let Err(e) = store.ping().await {
            tracing::error!(
                address = %config.coordination.address,
                error = %e,
                "Coordination store unreachable"
            );
            return Err(e.into());
        }

        let node = node_info(&config);
        let gateway: Arc<dyn InvocationGateway> =
            Arc::new(HttpGateway::new(config.inner_api.clone(), config.serverless.key.clone())?);
        let backend = build_backend(&config, node.clone(), gateway.clone())?;

        Ok(Self::from_parts(config, node, store, backend, gateway, decoder))
    }

    /// Assemble a context from already-built parts.
    pub fn from_parts(
        config: Config,
        node: NodeInfo,
        store: Arc<dyn CoordinationStore>,
        backend: Arc<dyn RuntimeBackend>,
        gateway: Arc<dyn InvocationGateway>,
        decoder: Arc<dyn PackageDecoder>,
    ) -> Arc<Self> {
        let mapping = Arc::new(RunningLocationMap::new(config.coordination.stale_after()));
        let announcer = ClusterAnnouncer::new(store.clone(), node.clone())
            .with_entry_ttl(config.coordination.stale_after());
        let registry = PluginRegistry::new(mapping.clone(), announcer.clone(), gateway);
        let media =
            Arc::new(MediaManager::new(config.media.cache_path.clone(), config.media.cache_size));
        let pipeline = InstallPipeline::new(
            backend.clone(),
            registry.clone(),
            DistributedLock::new(store.clone()),
            media.clone(),
            decoder,
            InstallSettings::from_config(&config),
        );

        tracing::info!(
            node = %node.node_id,
            address = %node.address,
            platform = %backend.kind(),
            "Daemon context ready"
        );

        Arc::new(Self {
            config,
            node,
            store,
            mapping,
            announcer,
            registry,
            backend,
            media,
            pipeline,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn node(&self) -> &NodeInfo {
        &self.node
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    pub fn mapping(&self) -> &Arc<RunningLocationMap> {
        &self.mapping
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn backend(&self) -> &Arc<dyn RuntimeBackend> {
        &self.backend
    }

    pub fn media(&self) -> &Arc<MediaManager> {
        &self.media
    }

    pub fn pipeline(&self) -> &InstallPipeline {
        &self.pipeline
    }

    pub async fn install(&self, package: PackageDescriptor) -> PluginResult<EventStream> {
        self.pipeline.install(package).await
    }

    pub async fn install_raw(&self, raw: &[u8]) -> PluginResult<EventStream> {
        self.pipeline.install_raw(raw).await
    }

    /// Route a request to a plugin wherever it runs.
    pub async fn invoke(
        &self,
        identity: &PluginUniqueIdentifier,
        request: InvokeRequest,
    ) -> PluginResult<EventStream> {
        match self.registry.lookup(identity).await {
            Some(Resolved::Local(lifetime)) => self.backend.invoke(&lifetime, request).await,
            Some(Resolved::Remote(lifetime)) => lifetime.invoke(request).await,
            None => Err(PluginError::NotFound(identity.clone())),
        }
    }

    fn watcher_backoff(&self) -> RetryConfig {
        let watcher = &self.config.watcher;
        RetryConfig::backoff(watcher.reconnect_initial(), watcher.reconnect_max())
    }

    pub fn remote_watcher(&self) -> RemoteWatcher {
        RemoteWatcher::new(self.announcer.clone(), self.mapping.clone(), self.watcher_backoff())
    }

    pub fn local_watcher(&self) -> LocalWatcher {
        LocalWatcher::new(
            self.config.daemon.storage_path.clone(),
            self.pipeline.clone(),
            self.registry.clone(),
            self.config.watcher.scan_interval(),
            self.watcher_backoff(),
        )
    }

    /// Start the watchers and the heartbeat loop.
    pub fn spawn_background(&self, shutdown: Shutdown) -> BackgroundTasks {
        let mut handles = Vec::new();

        handles.push(tokio::spawn(self.remote_watcher().run(shutdown.clone())));

        if self.config.daemon.platform == Platform::Local {
            handles.push(tokio::spawn(self.local_watcher().run(shutdown.clone())));
        }

        let registry = self.registry.clone();
        let period = self.config.coordination.heartbeat_interval();
        let mut stop = shutdown;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    () = stop.triggered() => break,
                    _ = ticker.tick() => {
                        let failures = registry.heartbeat().await;
                        if failures > 0 {
                            tracing::warn!(failures, "Heartbeat could not refresh every plugin");
                        }
                    }
                }
            }
        }));

        tracing::debug!(tasks = handles.len(), "Background tasks started");
        BackgroundTasks { handles }
    }

    /// Stop every plugin hosted by this node.
    pub async fn shutdown(&self) {
        tracing::info!(plugins = self.registry.len(), "Shutting down");
        self.registry.shutdown_all().await;
    }
}

fn node_info(config: &Config) -> NodeInfo {
    let node_id = if config.daemon.node_id.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        config.daemon.node_id.clone()
    };
    NodeInfo::new(node_id, config.daemon.advertise_address.clone())
}

/// Handles of the tasks started by [`DaemonContext::spawn_background`].
#[derive(Debug)]
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every task; call after triggering shutdown.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    tracing::error!(error = %e, "Background task panicked");
                }
            }
        }
    }

    pub fn abort(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

//! Shared fakes for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::watch;

use plugind::cluster::{CoordinationStore, NodeInfo};
use plugind::core::Config;
use plugind::plugin::{
    EventStream, InvokeRequest, LogLevel, ManifestDecoder, PackageDescriptor, PluginError,
    PluginLifetime, PluginManifest, PluginResult, PluginUniqueIdentifier, PluginUniversalEvent,
    ProgressSink, RunningLocation, RuntimeKind,
};
use plugind::runtime::{InvocationGateway, RuntimeBackend};
use plugind::DaemonContext;

/// A plugin that answers every request with one chunk naming its node.
pub struct FakeLifetime {
    identity: PluginUniqueIdentifier,
    location: RunningLocation,
    stopped: watch::Sender<bool>,
}

impl FakeLifetime {
    /// Simulate the backend dying on its own.
    pub fn crash(&self) {
        self.stopped.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }
}

#[async_trait]
impl PluginLifetime for FakeLifetime {
    fn identity(&self) -> &PluginUniqueIdentifier {
        &self.identity
    }

    fn runtime(&self) -> RuntimeKind {
        RuntimeKind::Local
    }

    fn location(&self) -> RunningLocation {
        self.location.clone()
    }

    async fn invoke(&self, request: InvokeRequest) -> PluginResult<EventStream> {
        if self.is_stopped() {
            return Err(PluginError::Invocation("plugin stopped".into()));
        }
        let session = request.session_id.clone();
        let events = vec![
            PluginUniversalEvent::stream(
                session.clone(),
                json!({ "action": request.action, "echo": request.data }),
            ),
            PluginUniversalEvent::end(session, json!({ "node": self.location.node_id })),
        ];
        Ok(futures::stream::iter(events).boxed())
    }

    async fn shutdown(&self) -> PluginResult<()> {
        self.crash();
        Ok(())
    }

    async fn closed(&self) {
        let _ = self.stopped.subscribe().wait_for(|stopped| *stopped).await;
    }
}

/// Backend handing out [`FakeLifetime`]s after a short delay.
pub struct FakeBackend {
    node: NodeInfo,
    delay: Duration,
    provisions: AtomicUsize,
    lifetimes: Mutex<Vec<Arc<FakeLifetime>>>,
}

impl FakeBackend {
    pub fn new(node: NodeInfo, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            node,
            delay,
            provisions: AtomicUsize::new(0),
            lifetimes: Mutex::new(Vec::new()),
        })
    }

    pub fn provisions(&self) -> usize {
        self.provisions.load(Ordering::SeqCst)
    }

    pub fn last_lifetime(&self) -> Option<Arc<FakeLifetime>> {
        self.lifetimes.lock().last().cloned()
    }
}

#[async_trait]
impl RuntimeBackend for FakeBackend {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Local
    }

    async fn provision(
        &self,
        package: &PackageDescriptor,
        progress: &ProgressSink,
    ) -> PluginResult<Arc<dyn PluginLifetime>> {
        self.provisions.fetch_add(1, Ordering::SeqCst);
        progress.log(LogLevel::Info, "provisioning");
        tokio::time::sleep(self.delay).await;

        let (stopped, _) = watch::channel(false);
        let lifetime = Arc::new(FakeLifetime {
            identity: package.identity.clone(),
            location: self.node.location(RuntimeKind::Local, "pid:4242"),
            stopped,
        });
        self.lifetimes.lock().push(lifetime.clone());
        Ok(lifetime)
    }
}

/// Gateway that delivers invocations straight into another in-process node.
#[derive(Default)]
pub struct LoopbackGateway {
    nodes: Mutex<HashMap<String, Weak<DaemonContext>>>,
}

impl LoopbackGateway {
    pub fn attach(&self, context: &Arc<DaemonContext>) {
        self.nodes.lock().insert(context.node().node_id.clone(), Arc::downgrade(context));
    }
}

#[async_trait]
impl InvocationGateway for LoopbackGateway {
    async fn invoke(
        &self,
        identity: &PluginUniqueIdentifier,
        location: &RunningLocation,
        request: InvokeRequest,
    ) -> PluginResult<EventStream> {
        let target = self.nodes.lock().get(&location.node_id).and_then(Weak::upgrade);
        let context = target
            .ok_or_else(|| PluginError::Invocation(format!("no route to {}", location.node_id)))?;
        let lifetime = context
            .registry()
            .get_local(identity)
            .ok_or_else(|| PluginError::NotFound(identity.clone()))?;
        lifetime.invoke(request).await
    }
}

pub fn test_config(root: &Path, node_id: &str) -> Config {
    let mut config = Config::default();
    config.daemon.node_id = node_id.to_string();
    config.daemon.advertise_address = format!("http://{node_id}");
    config.daemon.storage_path = root.join(node_id).join("plugins");
    config.daemon.working_path = root.join(node_id).join("cwd");
    config.media.cache_path = root.join(node_id).join("assets");
    config.coordination.lock_wait_secs = 5;
    config
}

/// A node with a fake backend, sharing `store` and `gateway` with its peers.
pub fn node(
    root: &Path,
    node_id: &str,
    store: Arc<dyn CoordinationStore>,
    gateway: &Arc<LoopbackGateway>,
) -> (Arc<DaemonContext>, Arc<FakeBackend>) {
    node_with_config(test_config(root, node_id), store, gateway)
}

/// Like [`node`], for a config the test has already adjusted.
pub fn node_with_config(
    config: Config,
    store: Arc<dyn CoordinationStore>,
    gateway: &Arc<LoopbackGateway>,
) -> (Arc<DaemonContext>, Arc<FakeBackend>) {
    let node_id = config.daemon.node_id.clone();
    let info = NodeInfo::new(node_id, config.daemon.advertise_address.clone());
    let backend = FakeBackend::new(info.clone(), Duration::from_millis(50));
    let context = DaemonContext::from_parts(
        config,
        info,
        store,
        backend.clone(),
        gateway.clone(),
        Arc::new(ManifestDecoder),
    );
    gateway.attach(&context);
    (context, backend)
}

pub fn manifest_toml(name: &str, version: &str) -> String {
    format!(
        r#"[plugin]
name = "{name}"
version = "{version}"
author = "acme"
description = "test plugin"

[runner]
entrypoint = "worker"
"#
    )
}

pub fn package(name: &str, version: &str) -> PackageDescriptor {
    let toml = manifest_toml(name, version);
    let manifest = PluginManifest::from_toml(&toml).unwrap();
    PackageDescriptor::from_manifest(manifest, toml.into_bytes()).unwrap()
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}

//! Install pipeline.
//!
//! Takes a decoded package from "bytes on this node" to "registered and
//! invocable", reporting progress as an event stream. Installs of the same
//! identity are serialized cluster-wide by the distributed lock and
//! deduplicated on this node by attaching to the in-flight job.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use super::{
    EventStream, LogLevel, PackageDecoder, PackageDescriptor, PluginError, PluginRegistry,
    PluginResult, PluginUniqueIdentifier, ProgressSink, RuntimeKind,
};
use crate::cluster::{AcquireMode, DistributedLock, LockToken};
use crate::core::{Config, RetryConfig};
use crate::media::MediaManager;
use crate::runtime::RuntimeBackend;

/// Payload of the terminal `session/end` event of an install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallOutcome {
    pub success: bool,
    pub identity: PluginUniqueIdentifier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The plugin was already running somewhere; nothing was provisioned.
    #[serde(default)]
    pub already_running: bool,
}

impl InstallOutcome {
    fn failed(identity: PluginUniqueIdentifier, error: &PluginError) -> Self {
        Self {
            success: false,
            identity,
            runtime: None,
            node_id: None,
            error: Some(error.to_string()),
            already_running: false,
        }
    }

    fn running(identity: PluginUniqueIdentifier, runtime: RuntimeKind, node_id: String) -> Self {
        Self {
            success: true,
            identity,
            runtime: Some(runtime),
            node_id: Some(node_id),
            error: None,
            already_running: false,
        }
    }

    /// Drain an install stream and decode its terminal event.
    ///
    /// `None` if the stream ended without a well-formed `end`.
    pub async fn from_stream(mut stream: EventStream) -> Option<Self> {
        while let Some(event) = stream.next().await {
            if let Some(message) = event.as_session() {
                if event.is_end() {
                    return serde_json::from_value(message.data).ok();
                }
            }
        }
        None
    }
}

/// Tunables for the pipeline.
#[derive(Debug, Clone)]
pub struct InstallSettings {
    pub max_package_size: u64,
    pub lock_ttl: Duration,
    /// Backoff used while another node holds the install lock.
    pub lock_wait: RetryConfig,
}

impl InstallSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_package_size: config.daemon.max_package_size,
            lock_ttl: config.coordination.lock_ttl(),
            lock_wait: RetryConfig::within(config.coordination.lock_wait()),
        }
    }
}

/// Orchestrates installs.
#[derive(Clone)]
pub struct InstallPipeline {
    backend: Arc<dyn RuntimeBackend>,
    registry: PluginRegistry,
    lock: DistributedLock,
    media: Arc<MediaManager>,
    decoder: Arc<dyn PackageDecoder>,
    settings: InstallSettings,
    in_flight: Arc<DashMap<PluginUniqueIdentifier, ProgressSink>>,
}

impl InstallPipeline {
    pub fn new(
        backend: Arc<dyn RuntimeBackend>,
        registry: PluginRegistry,
        lock: DistributedLock,
        media: Arc<MediaManager>,
        decoder: Arc<dyn PackageDecoder>,
        settings: InstallSettings,
    ) -> Self {
        Self {
            backend,
            registry,
            lock,
            media,
            decoder,
            settings,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn settings(&self) -> &InstallSettings {
        &self.settings
    }

    pub fn decoder(&self) -> &Arc<dyn PackageDecoder> {
        &self.decoder
    }

    /// Number of installs currently running on this node.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Decode raw package bytes, then install.
    ///
    /// Oversized input and decode failures are returned as errors; there is
    /// no identity to report them under.
    pub async fn install_raw(&self, raw: &[u8]) -> PluginResult<EventStream> {
        let size = raw.len() as u64;
        if size > self.settings.max_package_size {
            return Err(PluginError::PackageTooLarge { size, max: self.settings.max_package_size });
        }

        let package = self.decoder.decode(raw)?;
        self.install(package).await
    }

    /// Install a package, returning its progress stream.
    ///
    /// The stream always ends with a `session/end` event carrying an
    /// [`InstallOutcome`]. Dropping it does not cancel the install.
    pub async fn install(&self, package: PackageDescriptor) -> PluginResult<EventStream> {
        let identity = package.identity.clone();
        let session_id = uuid::Uuid::new_v4().to_string();

        if package.size > self.settings.max_package_size {
            let error = PluginError::PackageTooLarge {
                size: package.size,
                max: self.settings.max_package_size,
            };
            tracing::warn!(identity = %identity, error = %error, "Rejected package");

            let sink = ProgressSink::detached(session_id);
            let stream = sink.subscribe();
            sink.log(LogLevel::Error, error.to_string());
            sink.end(outcome_value(&InstallOutcome::failed(identity, &error)));
            return Ok(stream);
        }

        let sink = match self.in_flight.entry(identity.clone()) {
            Entry::Occupied(existing) => {
                tracing::debug!(identity = %identity, "Attaching to in-flight install");
                return Ok(existing.get().subscribe());
            }
            Entry::Vacant(slot) => slot.insert(ProgressSink::detached(session_id)).clone(),
        };
        let stream = sink.subscribe();

        let mode = AcquireMode::Wait(self.settings.lock_wait.clone());
        let token =
            match self.lock.acquire(identity.as_str(), self.settings.lock_ttl, &mode).await {
                Ok(token) => token,
                Err(e) => {
                    let error = PluginError::from(e);
                    tracing::warn!(identity = %identity, error = %error, "Install lock unavailable");
                    self.in_flight.remove(&identity);
                    sink.log(LogLevel::Error, error.to_string());
                    sink.end(outcome_value(&InstallOutcome::failed(identity, &error)));
                    return Err(error);
                }
            };

        tracing::info!(identity = %identity, "Installing plugin");
        sink.log(LogLevel::Info, format!("installing {identity}"));

        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.run(package, sink, token).await });

        Ok(stream)
    }

    async fn run(self, package: PackageDescriptor, sink: ProgressSink, token: LockToken) {
        let identity = package.identity.clone();
        let keeper = self.lock.keep_alive(token.clone(), self.settings.lock_ttl);

        let outcome = match self.provision(&package, &sink).await {
            Ok(outcome) => {
                tracing::info!(
                    identity = %identity,
                    already_running = outcome.already_running,
                    "Install finished"
                );
                outcome
            }
            Err(e) => {
                tracing::error!(identity = %identity, error = %e, "Install failed");
                sink.log(LogLevel::Error, e.to_string());
                InstallOutcome::failed(identity.clone(), &e)
            }
        };

        drop(keeper);
        if let Err(e) = self.lock.release(&token).await {
            tracing::warn!(identity = %identity, error = %e, "Failed to release install lock");
        }

        self.in_flight.remove(&identity);
        sink.end(outcome_value(&outcome));
    }

    async fn provision(
        &self,
        package: &PackageDescriptor,
        sink: &ProgressSink,
    ) -> PluginResult<InstallOutcome> {
        let identity = &package.identity;

        if let Some(resolved) = self.registry.lookup(identity).await {
            let location = resolved.lifetime().location();
            sink.log(LogLevel::Info, format!("already running on {}", location.node_id));
            return Ok(InstallOutcome {
                already_running: true,
                ..InstallOutcome::running(identity.clone(), location.runtime, location.node_id)
            });
        }

        for asset in &package.assets {
            let id = self.media.upload(&asset.bytes, asset.extension().unwrap_or_default()).await?;
            tracing::debug!(identity = %identity, asset = %asset.name, id = %id, "Stored asset");
        }
        if !package.assets.is_empty() {
            sink.log(LogLevel::Info, format!("stored {} assets", package.assets.len()));
        }

        let lifetime = self.backend.provision(package, sink).await?;
        let location = lifetime.location();

        if let Err(e) = self.registry.register(lifetime.clone()).await {
            if let Err(stop) = lifetime.shutdown().await {
                tracing::warn!(
                    identity = %identity,
                    error = %stop,
                    "Failed to stop unregistered plugin"
                );
            }
            // Lost a race with a local install that bypassed the lock.
            if matches!(e, PluginError::DuplicateIdentity(_)) {
                return Ok(InstallOutcome {
                    already_running: true,
                    ..InstallOutcome::running(identity.clone(), location.runtime, location.node_id)
                });
            }
            return Err(e);
        }

        sink.log(LogLevel::Info, format!("running on {} ({})", location.node_id, location.runtime));
        Ok(InstallOutcome::running(identity.clone(), location.runtime, location.node_id))
    }
}

fn outcome_value(outcome: &InstallOutcome) -> serde_json::Value {
    serde_json::to_value(outcome).unwrap_or_default()
}

//! Execution backends.
//!
//! A [`RuntimeBackend`] turns a decoded package into a running plugin and
//! hands back a [`PluginLifetime`] for it. Which backend a node uses is
//! decided once at startup from `daemon.platform`.

mod gateway;
mod local;
mod remote;
mod serverless;

pub use gateway::{ndjson_events, HttpGateway, InvocationGateway, API_KEY_HEADER, PLUGIN_HEADER};
pub use local::{LocalProcessBackend, LocalProcessLifetime};
pub use remote::RemoteLifetime;
pub use serverless::{
    FunctionPlatform, FunctionRef, HttpFunctionPlatform, ServerlessBackend, ServerlessLifetime,
};

use std::sync::Arc;

use async_trait::async_trait;

use crate::cluster::NodeInfo;
use crate::core::{Config, Platform};
use crate::plugin::{
    EventStream, InvokeRequest, PackageDescriptor, PluginLifetime, PluginResult, ProgressSink,
    RuntimeKind,
};

/// Polymorphic provisioning strategy.
#[async_trait]
pub trait RuntimeBackend: Send + Sync {
    /// Kind of lifetimes this backend produces.
    fn kind(&self) -> RuntimeKind;

    /// Make the package ready to receive invocations.
    ///
    /// Progress is reported through `progress` as `log` events; the caller
    /// owns the terminal `end` event.
    async fn provision(
        &self,
        package: &PackageDescriptor,
        progress: &ProgressSink,
    ) -> PluginResult<Arc<dyn PluginLifetime>>;

    /// Send a request to a lifetime this backend provisioned.
    async fn invoke(
        &self,
        lifetime: &Arc<dyn PluginLifetime>,
        request: InvokeRequest,
    ) -> PluginResult<EventStream> {
        lifetime.invoke(request).await
    }
}

/// Build the backend selected by `config.daemon.platform`.
pub fn build_backend(
    config: &Config,
    node: NodeInfo,
    gateway: Arc<dyn InvocationGateway>,
) -> PluginResult<Arc<dyn RuntimeBackend>> {
    let backend: Arc<dyn RuntimeBackend> = match config.daemon.platform {
        Platform::Local => Arc::new(LocalProcessBackend::new(
            node,
            config.daemon.working_path.clone(),
            config.daemon.max_package_size,
        )),
        Platform::Serverless => {
            let platform = HttpFunctionPlatform::new(&config.serverless)?;
            Arc::new(ServerlessBackend::new(
                node,
                Arc::new(platform),
                gateway,
                config.serverless.deploy_timeout(),
            ))
        }
    };

    tracing::info!(platform = %backend.kind(), "Runtime backend selected");
    Ok(backend)
}

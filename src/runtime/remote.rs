//! Routing handle for plugins hosted elsewhere in the cluster.

use std::sync::Arc;

use async_trait::async_trait;

use super::InvocationGateway;
use crate::plugin::{
    EventStream, InvokeRequest, PluginLifetime, PluginResult, PluginUniqueIdentifier,
    RunningLocation, RuntimeKind,
};

/// Forwards invocations to the node or function named by a running location.
///
/// The handle never provisions anything and owns no backend, so shutting
/// it down does nothing.
pub struct RemoteLifetime {
    identity: PluginUniqueIdentifier,
    location: RunningLocation,
    gateway: Arc<dyn InvocationGateway>,
}

impl RemoteLifetime {
    pub fn new(
        identity: PluginUniqueIdentifier,
        location: RunningLocation,
        gateway: Arc<dyn InvocationGateway>,
    ) -> Self {
        Self { identity, location, gateway }
    }
}

#[async_trait]
impl PluginLifetime for RemoteLifetime {
    fn identity(&self) -> &PluginUniqueIdentifier {
        &self.identity
    }

    fn runtime(&self) -> RuntimeKind {
        RuntimeKind::Remote
    }

    fn location(&self) -> RunningLocation {
        self.location.clone()
    }

    async fn invoke(&self, request: InvokeRequest) -> PluginResult<EventStream> {
        self.gateway.invoke(&self.identity, &self.location, request).await
    }

    async fn shutdown(&self) -> PluginResult<()> {
        Ok(())
    }
}

//! Live handles over running plugin backends.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{EventStream, PluginResult, PluginUniqueIdentifier, RuntimeKind};

/// A request routed to a plugin backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeRequest {
    /// Session all response events will carry.
    pub session_id: String,
    /// Plugin-defined action name.
    pub action: String,
    /// Opaque request payload.
    #[serde(default)]
    pub data: Value,
}

impl InvokeRequest {
    /// Create a request with a fresh session id.
    pub fn new(action: impl Into<String>, data: Value) -> Self {
        Self { session_id: uuid::Uuid::new_v4().to_string(), action: action.into(), data }
    }
}

/// Where a plugin is running, as shared with the rest of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningLocation {
    /// Node hosting (or having deployed) the backend.
    pub node_id: String,
    /// Address other nodes use to reach that node.
    pub node_address: String,
    /// Backend kind.
    pub runtime: RuntimeKind,
    /// Backend-specific target: `pid:<n>` or a function URL.
    pub target: String,
}

/// Capability set of a running plugin backend.
///
/// A lifetime is owned by the registry once registered; it is shut down
/// exactly when its entry is removed.
#[async_trait]
pub trait PluginLifetime: Send + Sync {
    /// Identity of the plugin behind this handle.
    fn identity(&self) -> &PluginUniqueIdentifier;

    /// Backend kind.
    fn runtime(&self) -> RuntimeKind;

    /// Location published to the cluster.
    fn location(&self) -> RunningLocation;

    /// Send a request; events arrive on the returned stream until `end`.
    async fn invoke(&self, request: InvokeRequest) -> PluginResult<EventStream>;

    /// Stop the backend.
    async fn shutdown(&self) -> PluginResult<()>;

    /// Resolves once the backend has terminated, for whatever reason.
    async fn closed(&self) {
        futures::future::pending::<()>().await;
    }
}

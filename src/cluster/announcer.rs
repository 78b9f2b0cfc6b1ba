//! Publishes this node's running plugins to the coordination store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::{
    identity_from_key, running_key, ClusterError, ClusterResult, CoordinationStore, NodeInfo,
    RUNNING_PREFIX,
};
use crate::plugin::{PluginUniqueIdentifier, RunningLocation};

/// Writes, withdraws and reads running-location entries.
///
/// With an entry TTL set, announcements expire unless the heartbeat
/// re-announces them, so a node that dies stops being routed to.
#[derive(Clone)]
pub struct ClusterAnnouncer {
    store: Arc<dyn CoordinationStore>,
    node: NodeInfo,
    entry_ttl: Option<Duration>,
}

impl ClusterAnnouncer {
    pub fn new(store: Arc<dyn CoordinationStore>, node: NodeInfo) -> Self {
        Self { store, node, entry_ttl: None }
    }

    /// Expire announcements after `ttl` of silence.
    pub fn with_entry_ttl(mut self, ttl: Duration) -> Self {
        self.entry_ttl = Some(ttl);
        self
    }

    pub fn entry_ttl(&self) -> Option<Duration> {
        self.entry_ttl
    }

    pub fn node(&self) -> &NodeInfo {
        &self.node
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    /// Publish a location, refreshing its expiry.
    pub async fn announce(
        &self,
        identity: &PluginUniqueIdentifier,
        location: &RunningLocation,
    ) -> ClusterResult<()> {
        let value = serde_json::to_string(location).map_err(|e| ClusterError::Malformed {
            key: running_key(identity),
            reason: e.to_string(),
        })?;
        let key = running_key(identity);
        match self.entry_ttl {
            Some(ttl) => self.store.set_with_ttl(&key, &value, ttl).await,
            None => self.store.set(&key, &value).await,
        }
    }

    /// Remove the entry if it still points at this node.
    ///
    /// Returns whether an entry was deleted.
    pub async fn withdraw(&self, identity: &PluginUniqueIdentifier) -> ClusterResult<bool> {
        match self.fetch(identity).await {
            Ok(Some(location)) if location.node_id == self.node.node_id => {
                self.store.delete(&running_key(identity)).await
            }
            Ok(_) => Ok(false),
            // An unreadable entry is removed so it cannot mislead other nodes.
            Err(ClusterError::Malformed { .. }) => self.store.delete(&running_key(identity)).await,
            Err(e) => Err(e),
        }
    }

    /// Read one entry.
    pub async fn fetch(
        &self,
        identity: &PluginUniqueIdentifier,
    ) -> ClusterResult<Option<RunningLocation>> {
        let key = running_key(identity);
        match self.store.get(&key).await? {
            Some(raw) => decode(&key, &raw).map(Some),
            None => Ok(None),
        }
    }

    /// Read every entry, skipping ones that cannot be decoded.
    pub async fn fetch_all(
        &self,
    ) -> ClusterResult<HashMap<PluginUniqueIdentifier, RunningLocation>> {
        let entries = self.store.list(RUNNING_PREFIX).await?;
        let mut locations = HashMap::with_capacity(entries.len());

        for (key, raw) in entries {
            let Some(identity) = identity_from_key(&key) else {
                tracing::warn!(key = %key, "Skipping running entry with malformed key");
                continue;
            };
            match decode(&key, &raw) {
                Ok(location) => {
                    locations.insert(identity, location);
                }
                Err(e) => tracing::warn!(error = %e, "Skipping malformed running entry"),
            }
        }

        Ok(locations)
    }
}

pub(super) fn decode(key: &str, raw: &str) -> ClusterResult<RunningLocation> {
    serde_json::from_str(raw)
        .map_err(|e| ClusterError::Malformed { key: key.to_string(), reason: e.to_string() })
}

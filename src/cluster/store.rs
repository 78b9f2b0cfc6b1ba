//! Coordination store abstraction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::{ClusterError, ClusterResult, MemoryStore};
use crate::core::CoordinationConfig;

/// A change under a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put { key: String, value: String },
    Delete { key: String },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// Change notifications for a prefix.
///
/// The stream ends (or yields an error) when the subscription is lost;
/// consumers must resubscribe and resync, since changes made while
/// disconnected are not replayed.
pub type WatchStream = BoxStream<'static, ClusterResult<WatchEvent>>;

/// Shared key-value store with leases and change notifications.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Check that the store is reachable.
    async fn ping(&self) -> ClusterResult<()>;

    async fn set(&self, key: &str, value: &str) -> ClusterResult<()>;

    /// Set `key` so that it expires after `ttl` unless written again.
    ///
    /// Expiry is reported to watchers as a [`WatchEvent::Delete`].
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> ClusterResult<()>;

    async fn get(&self, key: &str) -> ClusterResult<Option<String>>;

    /// Delete a key; returns whether it existed.
    async fn delete(&self, key: &str) -> ClusterResult<bool>;

    /// All key-value pairs under `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> ClusterResult<Vec<(String, String)>>;

    /// Subscribe to changes under `prefix`.
    async fn watch(&self, prefix: &str) -> ClusterResult<WatchStream>;

    /// Set `key` to `owner` with an expiry, unless a live lease exists.
    async fn acquire_lock(&self, key: &str, owner: &str, ttl: Duration) -> ClusterResult<bool>;

    /// Remove `key` if `owner` holds it.
    async fn release_lock(&self, key: &str, owner: &str) -> ClusterResult<bool>;

    /// Extend the lease on `key` if `owner` still holds it.
    async fn refresh_lock(&self, key: &str, owner: &str, ttl: Duration) -> ClusterResult<bool>;
}

/// Open the store named by `config.address`.
///
/// Only the process-local `memory://` store ships with the daemon.
pub fn connect_store(config: &CoordinationConfig) -> ClusterResult<Arc<dyn CoordinationStore>> {
    match config.address.split_once("://") {
        Some(("memory", _)) => Ok(Arc::new(MemoryStore::new())),
        _ => Err(ClusterError::UnsupportedStore(config.address.clone())),
    }
}

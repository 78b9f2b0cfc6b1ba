//! Cluster coordination: the shared store, install locks, the running
//! location mapping and the watchers that keep this node in sync.

mod announcer;
mod local_watcher;
mod lock;
mod mapping;
mod memory;
mod remote_watcher;
mod store;

pub use announcer::ClusterAnnouncer;
pub use local_watcher::{LocalWatcher, ScanReport};
pub use lock::{AcquireMode, DistributedLock, LeaseKeeper, LockToken, LOCK_PREFIX};
pub use mapping::{
    identity_from_key, running_key, MappingEntry, ResyncReport, RunningLocationMap, RUNNING_PREFIX,
};
pub use memory::MemoryStore;
pub use remote_watcher::RemoteWatcher;
pub use store::{connect_store, CoordinationStore, WatchEvent, WatchStream};

use thiserror::Error;
use tokio::sync::watch;

use crate::plugin::{RunningLocation, RuntimeKind};

/// Result type for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors from the coordination store and the primitives built on it.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Another owner holds the lock.
    #[error("Lock '{0}' is held by another owner")]
    LockHeld(String),

    /// The lease expired or changed owner before release or refresh.
    #[error("Lock '{0}' is no longer owned by this holder")]
    LockLost(String),

    /// The store could not be reached.
    #[error("Coordination store unavailable: {0}")]
    Unavailable(String),

    /// A change subscription ended.
    #[error("Coordination watch disconnected")]
    Disconnected,

    /// A stored value could not be decoded.
    #[error("Malformed value under '{key}': {reason}")]
    Malformed { key: String, reason: String },

    /// No store implementation for the configured address.
    #[error("Unsupported coordination store address '{0}'")]
    UnsupportedStore(String),
}

/// Lifecycle state of a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Idle,
    Watching,
    Reconnecting,
}

/// Sending half of a shutdown signal.
#[derive(Debug)]
pub struct ShutdownTrigger(watch::Sender<bool>);

/// Receiving half of a shutdown signal; cheap to clone into tasks.
#[derive(Debug, Clone)]
pub struct Shutdown(watch::Receiver<bool>);

/// Create a linked shutdown trigger and signal.
pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger(tx), Shutdown(rx))
}

impl ShutdownTrigger {
    /// Signal every holder of the linked [`Shutdown`].
    pub fn trigger(&self) {
        let _ = self.0.send(true);
    }

    /// Another receiver for the same signal.
    pub fn subscribe(&self) -> Shutdown {
        Shutdown(self.0.subscribe())
    }
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown is signalled or the trigger is dropped.
    pub async fn triggered(&mut self) {
        let _ = self.0.wait_for(|stop| *stop).await;
    }
}

/// This node's identity within the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_id: String,
    pub address: String,
}

impl NodeInfo {
    pub fn new(node_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self { node_id: node_id.into(), address: address.into() }
    }

    /// A location on this node.
    pub fn location(&self, runtime: RuntimeKind, target: impl Into<String>) -> RunningLocation {
        RunningLocation {
            node_id: self.node_id.clone(),
            node_address: self.address.clone(),
            runtime,
            target: target.into(),
        }
    }
}

//! Process-local coordination store.
//!
//! Backs single-node deployments and tests. Several daemon contexts in one
//! process can share a `MemoryStore` to behave like a cluster.
//!
//! Entries written with a TTL are expired lazily: every store call first
//! drops the entries whose deadline has passed and notifies watchers.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{ClusterError, ClusterResult, CoordinationStore, WatchEvent, WatchStream};

struct Lease {
    owner: String,
    expires_at: Instant,
}

struct Subscriber {
    prefix: String,
    tx: mpsc::UnboundedSender<ClusterResult<WatchEvent>>,
}

struct State {
    entries: BTreeMap<String, String>,
    expiries: HashMap<String, Instant>,
    leases: HashMap<String, Lease>,
    subscribers: Vec<Subscriber>,
    available: bool,
}

impl State {
    fn check(&self) -> ClusterResult<()> {
        if self.available {
            Ok(())
        } else {
            Err(ClusterError::Unavailable("memory store offline".to_string()))
        }
    }

    fn notify(&mut self, event: &WatchEvent) {
        self.subscribers.retain(|sub| {
            if !event.key().starts_with(&sub.prefix) {
                return !sub.tx.is_closed();
            }
            sub.tx.send(Ok(event.clone())).is_ok()
        });
    }

    fn expire_entries(&mut self) {
        if self.expiries.is_empty() {
            return;
        }
        let now = Instant::now();
        let expired: Vec<String> = self
            .expiries
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in expired {
            self.expiries.remove(&key);
            if self.entries.remove(&key).is_some() {
                tracing::debug!(key = %key, "Entry expired");
                self.notify(&WatchEvent::Delete { key });
            }
        }
    }

    fn put(&mut self, key: &str, value: &str, ttl: Option<Duration>) {
        if let Some(ttl) = ttl {
            self.expiries.insert(key.to_string(), Instant::now() + ttl);
        } else {
            self.expiries.remove(key);
        }
        self.entries.insert(key.to_string(), value.to_string());
        self.notify(&WatchEvent::Put { key: key.to_string(), value: value.to_string() });
    }

    fn live_lease(&mut self, key: &str) -> Option<&Lease> {
        let expired = self.leases.get(key).is_some_and(|l| l.expires_at <= Instant::now());
        if expired {
            self.leases.remove(key);
        }
        self.leases.get(key)
    }
}

/// In-memory [`CoordinationStore`].
pub struct MemoryStore {
    state: Mutex<State>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                entries: BTreeMap::new(),
                expiries: HashMap::new(),
                leases: HashMap::new(),
                subscribers: Vec::new(),
                available: true,
            }),
        }
    }

    /// End every open watch stream, as a dropped connection would.
    pub fn disconnect_watchers(&self) {
        self.state.lock().subscribers.clear();
    }

    /// Take the store offline (every call fails) or bring it back.
    pub fn set_available(&self, available: bool) {
        let mut state = self.state.lock();
        state.available = available;
        if !available {
            state.subscribers.clear();
        }
    }

    /// Number of open watch subscriptions.
    pub fn watcher_count(&self) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|sub| !sub.tx.is_closed());
        state.subscribers.len()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn ping(&self) -> ClusterResult<()> {
        self.state.lock().check()
    }

    async fn set(&self, key: &str, value: &str) -> ClusterResult<()> {
        let mut state = self.state.lock();
        state.check()?;
        state.expire_entries();
        state.put(key, value, None);
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> ClusterResult<()> {
        let mut state = self.state.lock();
        state.check()?;
        state.expire_entries();
        state.put(key, value, Some(ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> ClusterResult<Option<String>> {
        let mut state = self.state.lock();
        state.check()?;
        state.expire_entries();
        Ok(state.entries.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> ClusterResult<bool> {
        let mut state = self.state.lock();
        state.check()?;
        state.expire_entries();
        state.expiries.remove(key);
        let existed = state.entries.remove(key).is_some();
        if existed {
            state.notify(&WatchEvent::Delete { key: key.to_string() });
        }
        Ok(existed)
    }

    async fn list(&self, prefix: &str) -> ClusterResult<Vec<(String, String)>> {
        let mut state = self.state.lock();
        state.check()?;
        state.expire_entries();
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn watch(&self, prefix: &str) -> ClusterResult<WatchStream> {
        let mut state = self.state.lock();
        state.check()?;
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.push(Subscriber { prefix: prefix.to_string(), tx });
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn acquire_lock(&self, key: &str, owner: &str, ttl: Duration) -> ClusterResult<bool> {
        let mut state = self.state.lock();
        state.check()?;
        if state.live_lease(key).is_some() {
            return Ok(false);
        }
        state.leases.insert(
            key.to_string(),
            Lease { owner: owner.to_string(), expires_at: Instant::now() + ttl },
        );
        Ok(true)
    }

    async fn release_lock(&self, key: &str, owner: &str) -> ClusterResult<bool> {
        let mut state = self.state.lock();
        state.check()?;
        if state.live_lease(key).is_some_and(|lease| lease.owner == owner) {
            state.leases.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn refresh_lock(&self, key: &str, owner: &str, ttl: Duration) -> ClusterResult<bool> {
        let mut state = self.state.lock();
        state.check()?;
        if !state.live_lease(key).is_some_and(|lease| lease.owner == owner) {
            return Ok(false);
        }
        if let Some(lease) = state.leases.get_mut(key) {
            lease.expires_at = Instant::now() + ttl;
        }
        Ok(true)
    }
}

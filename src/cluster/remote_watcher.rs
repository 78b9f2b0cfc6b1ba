//! Keeps the running-location mapping in step with the coordination store.
//!
//! The watcher subscribes before it resyncs, so no change can fall between
//! the snapshot and the first notification. Whenever the subscription drops
//! it backs off, resubscribes and resyncs again; changes made while
//! disconnected are recovered by the diff rather than replayed.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;

use super::announcer::decode;
use super::{
    identity_from_key, ClusterAnnouncer, ClusterError, ClusterResult, ResyncReport,
    RunningLocationMap, Shutdown, WatchEvent, WatchStream, WatcherState, RUNNING_PREFIX,
};
use crate::core::RetryConfig;

pub struct RemoteWatcher {
    announcer: ClusterAnnouncer,
    mapping: Arc<RunningLocationMap>,
    backoff: RetryConfig,
    state: watch::Sender<WatcherState>,
}

impl RemoteWatcher {
    pub fn new(
        announcer: ClusterAnnouncer,
        mapping: Arc<RunningLocationMap>,
        backoff: RetryConfig,
    ) -> Self {
        let (state, _) = watch::channel(WatcherState::Idle);
        Self { announcer, mapping, backoff, state }
    }

    /// Observe state transitions.
    pub fn state(&self) -> watch::Receiver<WatcherState> {
        self.state.subscribe()
    }

    /// Replace the mapping with the store's current contents.
    pub async fn resync(&self) -> ClusterResult<ResyncReport> {
        let authoritative = self.announcer.fetch_all().await?;
        Ok(self.mapping.replace_all(authoritative))
    }

    /// Run until `shutdown` fires.
    pub async fn run(self, mut shutdown: Shutdown) {
        let mut attempt: u32 = 0;

        while !shutdown.is_triggered() {
            match self.connect().await {
                Ok((stream, report)) => {
                    attempt = 0;
                    self.state.send_replace(WatcherState::Watching);
                    if report.is_clean() {
                        tracing::debug!("Running locations in sync");
                    } else {
                        tracing::info!(
                            added = report.added,
                            updated = report.updated,
                            removed = report.removed,
                            "Resynced running locations"
                        );
                    }

                    match self.consume(stream, &mut shutdown).await {
                        Ok(()) => break,
                        Err(e) => tracing::warn!(error = %e, "Running location watch lost"),
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Failed to watch running locations"),
            }

            self.state.send_replace(WatcherState::Reconnecting);
            attempt = attempt.saturating_add(1);
            let delay = self.backoff.delay_for_attempt(attempt);
            tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = shutdown.triggered() => break,
            }
        }

        self.state.send_replace(WatcherState::Idle);
    }

    async fn connect(&self) -> ClusterResult<(WatchStream, ResyncReport)> {
        let stream = self.announcer.store().watch(RUNNING_PREFIX).await?;
        let report = self.resync().await?;
        Ok((stream, report))
    }

    /// Apply notifications until shutdown (`Ok`) or until the subscription
    /// is lost.
    async fn consume(
        &self,
        mut stream: WatchStream,
        shutdown: &mut Shutdown,
    ) -> ClusterResult<()> {
        loop {
            tokio::select! {
                () = shutdown.triggered() => return Ok(()),
                next = stream.next() => match next {
                    Some(Ok(event)) => self.apply(event),
                    Some(Err(e)) => return Err(e),
                    None => return Err(ClusterError::Disconnected),
                },
            }
        }
    }

    fn apply(&self, event: WatchEvent) {
        let Some(identity) = identity_from_key(event.key()) else {
            return;
        };

        match event {
            WatchEvent::Put { key, value } => match decode(&key, &value) {
                Ok(location) => {
                    tracing::debug!(identity = %identity, node = %location.node_id, "Plugin announced");
                    self.mapping.upsert(identity, location);
                }
                Err(e) => tracing::warn!(error = %e, "Ignoring malformed running entry"),
            },
            WatchEvent::Delete { .. } => {
                tracing::debug!(identity = %identity, "Plugin withdrawn");
                self.mapping.remove(&identity);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cluster::{shutdown_channel, CoordinationStore, MemoryStore, NodeInfo};
    use crate::plugin::{PluginUniqueIdentifier, RuntimeKind};

    fn id(name: &str) -> PluginUniqueIdentifier {
        PluginUniqueIdentifier::new(Some("acme"), name, "1.0.0", "beef").unwrap()
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_watcher_follows_store_and_recovers_missed_changes() {
        let store = Arc::new(MemoryStore::new());
        let other = ClusterAnnouncer::new(store.clone(), NodeInfo::new("other", "http://other"));
        let mapping = Arc::new(RunningLocationMap::new(Duration::from_secs(60)));

        // Present before the watcher starts: picked up by the initial resync.
        let location = other.node().location(RuntimeKind::Local, "pid:1");
        other.announce(&id("early"), &location).await.unwrap();

        let watcher = RemoteWatcher::new(
            ClusterAnnouncer::new(store.clone(), NodeInfo::new("self", "http://self")),
            mapping.clone(),
            RetryConfig::backoff(Duration::from_millis(20), Duration::from_millis(50)),
        );
        let mut state = watcher.state();
        let (trigger, shutdown) = shutdown_channel();
        let task = tokio::spawn(watcher.run(shutdown));

        state.wait_for(|s| *s == WatcherState::Watching).await.unwrap();
        assert!(mapping.get_fresh(&id("early")).is_some());

        other.announce(&id("live"), &location).await.unwrap();
        wait_for(|| mapping.get_fresh(&id("live")).is_some()).await;

        // Changes while disconnected are recovered by the resync.
        store.disconnect_watchers();
        other.announce(&id("missed"), &location).await.unwrap();
        store.delete(&crate::cluster::running_key(&id("early"))).await.unwrap();

        wait_for(|| mapping.get_fresh(&id("missed")).is_some()).await;
        wait_for(|| mapping.get(&id("early")).is_none()).await;

        trigger.trigger();
        task.await.unwrap();
        assert_eq!(*state.borrow(), WatcherState::Idle);
    }

    #[tokio::test]
    async fn test_consume_reports_lost_subscription() {
        let store = Arc::new(MemoryStore::new());
        let watcher = RemoteWatcher::new(
            ClusterAnnouncer::new(store.clone(), NodeInfo::new("n", "http://n")),
            Arc::new(RunningLocationMap::new(Duration::from_secs(60))),
            RetryConfig::no_retry(),
        );
        let (_trigger, mut shutdown) = shutdown_channel();
        let stream = store.watch(RUNNING_PREFIX).await.unwrap();

        store.disconnect_watchers();

        let result = watcher.consume(stream, &mut shutdown).await;
        assert!(matches!(result, Err(ClusterError::Disconnected)));
    }

    #[tokio::test]
    async fn test_consume_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let watcher = RemoteWatcher::new(
            ClusterAnnouncer::new(store.clone(), NodeInfo::new("n", "http://n")),
            Arc::new(RunningLocationMap::new(Duration::from_secs(60))),
            RetryConfig::no_retry(),
        );
        let (trigger, mut shutdown) = shutdown_channel();
        let stream = store.watch(RUNNING_PREFIX).await.unwrap();

        trigger.trigger();

        assert!(watcher.consume(stream, &mut shutdown).await.is_ok());
    }

    #[tokio::test]
    async fn test_watcher_reconnects_after_outage() {
        let store = Arc::new(MemoryStore::new());
        let announcer = ClusterAnnouncer::new(store.clone(), NodeInfo::new("n", "http://n"));
        let mapping = Arc::new(RunningLocationMap::new(Duration::from_secs(60)));
        let watcher = RemoteWatcher::new(
            announcer.clone(),
            mapping.clone(),
            RetryConfig::backoff(Duration::from_millis(10), Duration::from_millis(20)),
        );
        let mut state = watcher.state();
        let (trigger, shutdown) = shutdown_channel();
        let task = tokio::spawn(watcher.run(shutdown));

        state.wait_for(|s| *s == WatcherState::Watching).await.unwrap();

        store.set_available(false);
        state.wait_for(|s| *s == WatcherState::Reconnecting).await.unwrap();

        store.set_available(true);
        let location = announcer.node().location(RuntimeKind::Serverless, "https://fn");
        announcer.announce(&id("after"), &location).await.unwrap();
        wait_for(|| mapping.get(&id("after")).is_some()).await;

        trigger.trigger();
        task.await.unwrap();
    }
}

//! Cluster-wide mutual exclusion over the coordination store.
//!
//! Locks are leases: a holder that crashes loses the lock once the TTL runs
//! out. Long operations keep the lease alive with a [`LeaseKeeper`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use super::{ClusterError, ClusterResult, CoordinationStore};
use crate::core::{retry_async_if, RetryConfig};

/// Key prefix for lock entries.
pub const LOCK_PREFIX: &str = "plugind/lock/";

/// Proof of lock ownership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    name: String,
    owner: String,
    acquired_at: DateTime<Utc>,
}

impl LockToken {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    fn key(&self) -> String {
        format!("{LOCK_PREFIX}{}", self.name)
    }
}

/// What to do when the lock is already held.
#[derive(Debug, Clone)]
pub enum AcquireMode {
    /// Return `LockHeld` immediately.
    FailFast,
    /// Retry with backoff, then return `LockHeld`.
    Wait(RetryConfig),
}

/// Lease-based lock manager.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn CoordinationStore>,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    /// Try once to take `name`.
    pub async fn try_acquire(&self, name: &str, ttl: Duration) -> ClusterResult<LockToken> {
        let token = LockToken {
            name: name.to_string(),
            owner: uuid::Uuid::new_v4().to_string(),
            acquired_at: Utc::now(),
        };

        if self.store.acquire_lock(&token.key(), &token.owner, ttl).await? {
            tracing::debug!(lock = name, owner = %token.owner, "Lock acquired");
            Ok(token)
        } else {
            Err(ClusterError::LockHeld(name.to_string()))
        }
    }

    /// Take `name`, waiting according to `mode`.
    pub async fn acquire(
        &self,
        name: &str,
        ttl: Duration,
        mode: &AcquireMode,
    ) -> ClusterResult<LockToken> {
        match mode {
            AcquireMode::FailFast => self.try_acquire(name, ttl).await,
            AcquireMode::Wait(retry) => {
                let outcome = retry_async_if(
                    retry,
                    |e: &ClusterError| matches!(e, ClusterError::LockHeld(_)),
                    move || self.try_acquire(name, ttl),
                )
                .await;
                if outcome.was_retried {
                    tracing::debug!(lock = name, attempts = outcome.attempts, "Waited for lock");
                }
                outcome.into_result()
            }
        }
    }

    /// Release a lock; `LockLost` if the lease already lapsed.
    pub async fn release(&self, token: &LockToken) -> ClusterResult<()> {
        if self.store.release_lock(&token.key(), &token.owner).await? {
            tracing::debug!(lock = %token.name, "Lock released");
            Ok(())
        } else {
            Err(ClusterError::LockLost(token.name.clone()))
        }
    }

    /// Extend a lease; `LockLost` if it already lapsed.
    pub async fn refresh(&self, token: &LockToken, ttl: Duration) -> ClusterResult<()> {
        if self.store.refresh_lock(&token.key(), &token.owner, ttl).await? {
            Ok(())
        } else {
            Err(ClusterError::LockLost(token.name.clone()))
        }
    }

    /// Refresh the lease every `ttl / 3` until the keeper is dropped.
    pub fn keep_alive(&self, token: LockToken, ttl: Duration) -> LeaseKeeper {
        let lock = self.clone();
        let period = (ttl / 3).max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                match lock.refresh(&token, ttl).await {
                    Ok(()) => {}
                    Err(ClusterError::LockLost(name)) => {
                        tracing::warn!(lock = %name, "Lease lost while held");
                        break;
                    }
                    Err(e) => tracing::warn!(lock = %token.name, error = %e, "Lease refresh failed"),
                }
            }
        });

        LeaseKeeper { handle }
    }
}

/// Background lease refresher; stops when dropped.
#[derive(Debug)]
pub struct LeaseKeeper {
    handle: JoinHandle<()>,
}

impl LeaseKeeper {
    /// Whether the keeper gave up because the lease was lost.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for LeaseKeeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemoryStore;

    fn lock() -> DistributedLock {
        DistributedLock::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_exclusive_acquire() {
        let lock = lock();
        let ttl = Duration::from_secs(30);

        let token = lock.try_acquire("plugin", ttl).await.unwrap();
        let second = lock.try_acquire("plugin", ttl).await;
        assert!(matches!(second, Err(ClusterError::LockHeld(_))));

        lock.release(&token).await.unwrap();
        assert!(lock.try_acquire("plugin", ttl).await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_mode_gives_up() {
        let lock = lock();
        let ttl = Duration::from_secs(30);
        let _held = lock.try_acquire("busy", ttl).await.unwrap();

        let mode = AcquireMode::Wait(RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            jitter: false,
            ..Default::default()
        });
        let result = lock.acquire("busy", ttl, &mode).await;
        assert!(matches!(result, Err(ClusterError::LockHeld(_))));
    }

    #[tokio::test]
    async fn test_wait_mode_acquires_after_release() {
        let lock = lock();
        let ttl = Duration::from_secs(30);
        let held = lock.try_acquire("busy", ttl).await.unwrap();

        let releaser = lock.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            releaser.release(&held).await.unwrap();
        });

        let mode = AcquireMode::Wait(RetryConfig::within(Duration::from_secs(5)));
        assert!(lock.acquire("busy", ttl, &mode).await.is_ok());
    }

    #[tokio::test]
    async fn test_release_after_expiry_is_lock_lost() {
        let lock = lock();
        let token = lock.try_acquire("short", Duration::from_millis(10)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let _other = lock.try_acquire("short", Duration::from_secs(30)).await.unwrap();

        assert!(matches!(lock.release(&token).await, Err(ClusterError::LockLost(_))));
    }

    #[tokio::test]
    async fn test_keep_alive_extends_lease() {
        let lock = lock();
        let ttl = Duration::from_millis(90);
        let token = lock.try_acquire("kept", ttl).await.unwrap();
        let keeper = lock.keep_alive(token.clone(), ttl);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(matches!(
            lock.try_acquire("kept", ttl).await,
            Err(ClusterError::LockHeld(_))
        ));

        drop(keeper);
        lock.release(&token).await.unwrap();
    }
}

//! This node's view of where every plugin in the cluster is running.
//!
//! The view is advisory: it is fed by store notifications and periodic
//! resyncs, and an entry older than `stale_after` is re-resolved from the
//! store before it is trusted.

use std::collections::HashMap;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::plugin::{PluginUniqueIdentifier, RunningLocation};

/// Key prefix for running-location entries.
pub const RUNNING_PREFIX: &str = "plugind/running/";

/// Store key of a plugin's running-location entry.
pub fn running_key(identity: &PluginUniqueIdentifier) -> String {
    format!("{RUNNING_PREFIX}{identity}")
}

/// Parse the identity out of a running-location key.
pub fn identity_from_key(key: &str) -> Option<PluginUniqueIdentifier> {
    key.strip_prefix(RUNNING_PREFIX)?.parse().ok()
}

/// A location plus when this node last confirmed it.
#[derive(Debug, Clone)]
pub struct MappingEntry {
    pub location: RunningLocation,
    pub refreshed_at: Instant,
}

/// Differences applied by a full resync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncReport {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

impl ResyncReport {
    /// Whether the local view already matched the store.
    pub fn is_clean(&self) -> bool {
        self.added == 0 && self.updated == 0 && self.removed == 0
    }
}

/// Concurrent identity → location map.
#[derive(Debug)]
pub struct RunningLocationMap {
    entries: DashMap<PluginUniqueIdentifier, MappingEntry>,
    stale_after: Duration,
}

impl RunningLocationMap {
    pub fn new(stale_after: Duration) -> Self {
        Self { entries: DashMap::new(), stale_after }
    }

    /// Insert or replace an entry, marking it fresh.
    pub fn upsert(&self, identity: PluginUniqueIdentifier, location: RunningLocation) {
        self.entries.insert(identity, MappingEntry { location, refreshed_at: Instant::now() });
    }

    pub fn remove(&self, identity: &PluginUniqueIdentifier) -> Option<RunningLocation> {
        self.entries.remove(identity).map(|(_, entry)| entry.location)
    }

    /// Entry regardless of age.
    pub fn get(&self, identity: &PluginUniqueIdentifier) -> Option<MappingEntry> {
        self.entries.get(identity).map(|entry| entry.clone())
    }

    /// Entry only if it was confirmed within `stale_after`.
    pub fn get_fresh(&self, identity: &PluginUniqueIdentifier) -> Option<RunningLocation> {
        self.entries
            .get(identity)
            .filter(|entry| entry.refreshed_at.elapsed() < self.stale_after)
            .map(|entry| entry.location.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Vec<(PluginUniqueIdentifier, RunningLocation)> {
        self.entries.iter().map(|e| (e.key().clone(), e.value().location.clone())).collect()
    }

    /// Replace the whole view with `authoritative`, reporting what changed.
    ///
    /// Every surviving entry is marked fresh.
    pub fn replace_all(
        &self,
        mut authoritative: HashMap<PluginUniqueIdentifier, RunningLocation>,
    ) -> ResyncReport {
        let mut report = ResyncReport::default();

        self.entries.retain(|identity, entry| match authoritative.remove(identity) {
            Some(location) => {
                if entry.location != location {
                    entry.location = location;
                    report.updated += 1;
                }
                entry.refreshed_at = Instant::now();
                true
            }
            None => {
                report.removed += 1;
                false
            }
        });

        report.added = authoritative.len();
        for (identity, location) in authoritative {
            self.upsert(identity, location);
        }

        report
    }
}

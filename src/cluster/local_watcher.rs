//! Installs plugin packages dropped into the storage directory.
//!
//! The directory is scanned on start, after filesystem notifications and on
//! a fixed interval. New `*.plugin` files go through the install pipeline;
//! files that disappear take their plugin down with them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, watch};

use super::{Shutdown, WatcherState};
use crate::core::RetryConfig;
use crate::plugin::{
    InstallOutcome, InstallPipeline, PluginError, PluginRegistry, PluginResult,
    PluginUniqueIdentifier, PACKAGE_EXTENSION,
};

const DEBOUNCE: Duration = Duration::from_millis(250);

#[cfg(feature = "fs-watch")]
type DirWatcher = notify::RecommendedWatcher;
#[cfg(not(feature = "fs-watch"))]
type DirWatcher = ();

/// What one scan changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub installed: usize,
    pub removed: usize,
    pub failed: usize,
}

impl ScanReport {
    pub fn is_empty(&self) -> bool {
        self.installed == 0 && self.removed == 0 && self.failed == 0
    }
}

// A package file and the plugin installed from it.
struct Tracked {
    identity: PluginUniqueIdentifier,
    modified: Option<SystemTime>,
}

pub struct LocalWatcher {
    storage_path: PathBuf,
    pipeline: InstallPipeline,
    registry: PluginRegistry,
    scan_interval: Duration,
    backoff: RetryConfig,
    known: HashMap<PathBuf, Tracked>,
    // Files that failed to install, keyed by the mtime that failed.
    rejected: HashMap<PathBuf, Option<SystemTime>>,
    state: watch::Sender<WatcherState>,
}

impl LocalWatcher {
    pub fn new(
        storage_path: impl Into<PathBuf>,
        pipeline: InstallPipeline,
        registry: PluginRegistry,
        scan_interval: Duration,
        backoff: RetryConfig,
    ) -> Self {
        let (state, _) = watch::channel(WatcherState::Idle);
        Self {
            storage_path: storage_path.into(),
            pipeline,
            registry,
            scan_interval,
            backoff,
            known: HashMap::new(),
            rejected: HashMap::new(),
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<WatcherState> {
        self.state.subscribe()
    }

    /// Identity installed from a tracked package file.
    pub fn identity_of(&self, path: &Path) -> Option<&PluginUniqueIdentifier> {
        self.known.get(path).map(|tracked| &tracked.identity)
    }

    /// Number of package files currently installed.
    pub fn tracked(&self) -> usize {
        self.known.len()
    }

    /// Bring the registry in line with the directory contents.
    pub async fn scan(&mut self) -> PluginResult<ScanReport> {
        tokio::fs::create_dir_all(&self.storage_path).await?;

        let mut present = HashMap::new();
        let mut entries = tokio::fs::read_dir(&self.storage_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !is_package(&path) {
                continue;
            }
            let metadata = entry.metadata().await?;
            if metadata.is_file() {
                present.insert(path, metadata.modified().ok());
            }
        }

        let mut report = ScanReport::default();

        // Rewritten files are taken down and installed again.
        let mut stale: Vec<_> = self
            .known
            .iter()
            .filter(|(path, tracked)| {
                present.get(*path).is_none_or(|modified| *modified != tracked.modified)
            })
            .map(|(path, _)| path.clone())
            .collect();
        stale.sort();

        for path in stale {
            let Some(tracked) = self.known.remove(&path) else { continue };
            // Identical packages under two names share one plugin.
            if self.known.values().any(|other| other.identity == tracked.identity) {
                continue;
            }

            let identity = tracked.identity;
            match self.registry.remove(&identity).await {
                Ok(()) => {
                    tracing::info!(path = %path.display(), identity = %identity, "Package removed");
                    report.removed += 1;
                }
                Err(PluginError::NotFound(_)) => {}
                Err(e) => tracing::warn!(identity = %identity, error = %e, "Failed to stop plugin"),
            }
        }

        let mut added: Vec<_> = present
            .iter()
            .filter(|(path, modified)| {
                !self.known.contains_key(*path)
                    && self.rejected.get(*path).is_none_or(|failed| failed != *modified)
            })
            .map(|(path, modified)| (path.clone(), *modified))
            .collect();
        added.sort();

        for (path, modified) in added {
            match self.install_file(&path).await {
                Ok(identity) => {
                    self.rejected.remove(&path);
                    self.known.insert(path, Tracked { identity, modified });
                    report.installed += 1;
                }
                // Someone else is installing it; try again next scan.
                Err(e) if e.is_conflict() => {
                    tracing::debug!(path = %path.display(), error = %e, "Package busy");
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to install package");
                    self.rejected.insert(path, modified);
                    report.failed += 1;
                }
            }
        }

        self.rejected.retain(|path, _| present.contains_key(path));

        Ok(report)
    }

    async fn install_file(&self, path: &Path) -> PluginResult<PluginUniqueIdentifier> {
        let raw = tokio::fs::read(path).await?;
        let stream = self.pipeline.install_raw(&raw).await?;

        match InstallOutcome::from_stream(stream).await {
            Some(outcome) if outcome.success => Ok(outcome.identity),
            Some(outcome) => Err(PluginError::InvalidPackage(
                outcome.error.unwrap_or_else(|| "install failed".to_string()),
            )),
            None => Err(PluginError::InvalidPackage("install ended without outcome".to_string())),
        }
    }

    /// Run until `shutdown` fires.
    pub async fn run(mut self, mut shutdown: Shutdown) {
        let (fs_tx, mut fs_rx) = mpsc::unbounded_channel();
        let mut dir_watcher: Option<DirWatcher> = None;
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.scan_interval,
            self.scan_interval,
        );
        let mut attempt: u32 = 0;

        while !shutdown.is_triggered() {
            match self.scan().await {
                Ok(report) => {
                    attempt = 0;
                    self.state.send_replace(WatcherState::Watching);
                    if !report.is_empty() {
                        tracing::info!(
                            installed = report.installed,
                            removed = report.removed,
                            failed = report.failed,
                            "Scanned plugin storage"
                        );
                    }
                    if dir_watcher.is_none() {
                        dir_watcher = watch_directory(&self.storage_path, fs_tx.clone());
                    }
                }
                Err(e) => {
                    self.state.send_replace(WatcherState::Reconnecting);
                    attempt = attempt.saturating_add(1);
                    let delay = self.backoff.delay_for_attempt(attempt);
                    tracing::warn!(
                        path = %self.storage_path.display(),
                        error = %e,
                        attempt,
                        "Plugin storage unreadable"
                    );
                    dir_watcher = None;

                    tokio::select! {
                        () = shutdown.triggered() => break,
                        () = tokio::time::sleep(delay) => continue,
                    }
                }
            }

            tokio::select! {
                () = shutdown.triggered() => break,
                _ = ticker.tick() => {}
                Some(()) = fs_rx.recv() => {
                    tokio::time::sleep(DEBOUNCE).await;
                    while fs_rx.try_recv().is_ok() {}
                }
            }
        }

        drop(dir_watcher);
        self.state.send_replace(WatcherState::Idle);
        tracing::debug!("Local watcher stopped");
    }
}

fn is_package(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some(PACKAGE_EXTENSION)
}

#[cfg(feature = "fs-watch")]
fn watch_directory(path: &Path, tx: mpsc::UnboundedSender<()>) -> Option<DirWatcher> {
    use notify::{RecursiveMode, Watcher};

    let mut watcher = match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if res.is_ok() {
            let _ = tx.send(());
        }
    }) {
        Ok(watcher) => watcher,
        Err(e) => {
            tracing::warn!(error = %e, "Filesystem watcher unavailable, relying on scans");
            return None;
        }
    };

    if let Err(e) = watcher.watch(path, RecursiveMode::NonRecursive) {
        tracing::warn!(path = %path.display(), error = %e, "Failed to watch plugin storage");
        return None;
    }
    Some(watcher)
}

#[cfg(not(feature = "fs-watch"))]
fn watch_directory(_path: &Path, _tx: mpsc::UnboundedSender<()>) -> Option<DirWatcher> {
    None
}

//! Local worker processes.
//!
//! A plugin runs as a child process speaking newline-delimited JSON: each
//! [`InvokeRequest`] is written to its stdin and every
//! [`PluginUniversalEvent`] it prints on stdout is routed back to the
//! session named in the event. Sessions are independent, so a worker may
//! interleave output for several concurrent requests.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::RuntimeBackend;
use crate::cluster::NodeInfo;
use crate::plugin::{
    BackendError, EventStream, InvokeRequest, LogLevel, PackageDescriptor, PluginError,
    PluginLifetime, PluginResult, PluginUniqueIdentifier, PluginUniversalEvent, ProgressSink,
    RunningLocation, RuntimeKind, ARCHIVE_FILE, MANIFEST_FILE,
};

/// Environment variable telling a worker which plugin it is.
const IDENTITY_ENV: &str = "PLUGIND_PLUGIN_IDENTIFIER";

/// Backend spawning one worker process per plugin.
pub struct LocalProcessBackend {
    node: NodeInfo,
    working_path: PathBuf,
    max_package_size: u64,
}

impl LocalProcessBackend {
    pub fn new(node: NodeInfo, working_path: PathBuf, max_package_size: u64) -> Self {
        Self { node, working_path, max_package_size }
    }

    /// Directory a plugin is unpacked into.
    pub fn plugin_dir(&self, identity: &PluginUniqueIdentifier) -> PathBuf {
        let checksum = identity.checksum();
        let short = &checksum[..checksum.len().min(12)];
        self.working_path
            .join(identity.author().unwrap_or("_"))
            .join(identity.name())
            .join(format!("{}-{short}", identity.version()))
    }
}

#[async_trait]
impl RuntimeBackend for LocalProcessBackend {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Local
    }

    async fn provision(
        &self,
        package: &PackageDescriptor,
        progress: &ProgressSink,
    ) -> PluginResult<Arc<dyn PluginLifetime>> {
        if package.size > self.max_package_size {
            return Err(PluginError::PackageTooLarge {
                size: package.size,
                max: self.max_package_size,
            });
        }

        let runner = &package.manifest.runner;
        if runner.entrypoint.is_empty() {
            return Err(PluginError::InvalidPackage("manifest has no runner entrypoint".into()));
        }

        let dir = self.plugin_dir(&package.identity);
        progress.log(LogLevel::Info, format!("Unpacking plugin to {}", dir.display()));
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(MANIFEST_FILE), package.manifest.to_toml()?).await?;
        tokio::fs::write(dir.join(ARCHIVE_FILE), &package.archive[..]).await?;

        let mut cmd = Command::new(&runner.entrypoint);
        cmd.args(&runner.args)
            .envs(&runner.env)
            .env(IDENTITY_ENV, package.identity.as_str())
            .current_dir(&dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| BackendError::SpawnFailed(format!("{}: {e}", runner.entrypoint)))?;

        let lifetime = LocalProcessLifetime::start(package.identity.clone(), &self.node, child)?;
        progress.log(LogLevel::Info, format!("Worker started ({})", lifetime.location.target));
        tracing::info!(
            identity = %package.identity,
            target = %lifetime.location.target,
            "Local worker started"
        );

        Ok(Arc::new(lifetime))
    }
}

type Sessions = Arc<DashMap<String, mpsc::UnboundedSender<PluginUniversalEvent>>>;

/// Handle over a running worker process.
pub struct LocalProcessLifetime {
    identity: PluginUniqueIdentifier,
    location: RunningLocation,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    sessions: Sessions,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    exited: watch::Receiver<bool>,
}

impl LocalProcessLifetime {
    fn start(
        identity: PluginUniqueIdentifier,
        node: &NodeInfo,
        mut child: Child,
    ) -> PluginResult<Self> {
        let missing =
            |stream: &str| BackendError::SpawnFailed(format!("worker {stream} not captured"));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let target =
            child.id().map_or_else(|| "pid:unknown".to_string(), |pid| format!("pid:{pid}"));
        let location = node.location(RuntimeKind::Local, target);
        let sessions: Sessions = Arc::new(DashMap::new());

        let reader = {
            let sessions = sessions.clone();
            let identity = identity.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    route_line(&identity, &sessions, &line);
                }
            })
        };

        {
            let identity = identity.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::info!(identity = %identity, "{line}");
                }
            });
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited) = watch::channel(false);
        {
            let identity = identity.clone();
            let sessions = sessions.clone();
            tokio::spawn(async move {
                let status = tokio::select! {
                    status = child.wait() => status,
                    _ = kill_rx => {
                        let _ = child.start_kill();
                        child.wait().await
                    }
                };
                match status {
                    Ok(status) => tracing::info!(identity = %identity, %status, "Worker exited"),
                    Err(e) => tracing::warn!(identity = %identity, error = %e, "Worker wait failed"),
                }

                // Let buffered output reach its sessions before closing them.
                let _ = tokio::time::timeout(Duration::from_secs(1), reader).await;
                close_sessions(&sessions, "plugin worker exited");
                exited_tx.send_replace(true);
            });
        }

        Ok(Self {
            identity,
            location,
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            sessions,
            kill: Mutex::new(Some(kill_tx)),
            exited,
        })
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }
}

fn route_line(identity: &PluginUniqueIdentifier, sessions: &Sessions, line: &str) {
    if line.trim().is_empty() {
        return;
    }

    let event = match PluginUniversalEvent::from_line(line) {
        Ok(event) => event,
        Err(e) => {
            tracing::debug!(identity = %identity, error = %e, "Ignoring non-event worker output");
            return;
        }
    };

    let session_id = event.session_id.clone();
    let is_end = event.is_end();
    match sessions.get(&session_id) {
        Some(tx) => {
            let _ = tx.send(event);
        }
        None => {
            tracing::debug!(
                identity = %identity,
                session = %session_id,
                "Event for unknown session"
            );
            return;
        }
    }
    if is_end {
        sessions.remove(&session_id);
    }
}

fn close_sessions(sessions: &Sessions, reason: &str) {
    let open: Vec<String> = sessions.iter().map(|entry| entry.key().clone()).collect();
    for session_id in open {
        if let Some((_, tx)) = sessions.remove(&session_id) {
            let _ = tx.send(PluginUniversalEvent::error(session_id.clone(), reason));
            let _ = tx.send(PluginUniversalEvent::end(session_id, serde_json::Value::Null));
        }
    }
}

#[async_trait]
impl PluginLifetime for LocalProcessLifetime {
    fn identity(&self) -> &PluginUniqueIdentifier {
        &self.identity
    }

    fn runtime(&self) -> RuntimeKind {
        RuntimeKind::Local
    }

    fn location(&self) -> RunningLocation {
        self.location.clone()
    }

    async fn invoke(&self, request: InvokeRequest) -> PluginResult<EventStream> {
        if self.has_exited() {
            let reason = format!("worker for {} has exited", self.identity);
            return Err(PluginError::Invocation(reason));
        }

        let mut line = serde_json::to_string(&request)?;
        line.push('\n');

        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.insert(request.session_id.clone(), tx);

        let written = {
            let mut stdin = self.stdin.lock().await;
            match stdin.as_mut() {
                Some(stdin) => match stdin.write_all(line.as_bytes()).await {
                    Ok(()) => stdin.flush().await,
                    Err(e) => Err(e),
                },
                None => Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin closed")),
            }
        };

        if let Err(e) = written {
            self.sessions.remove(&request.session_id);
            return Err(PluginError::Invocation(format!("failed to write to worker: {e}")));
        }

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn shutdown(&self) -> PluginResult<()> {
        self.stdin.lock().await.take();
        if let Some(kill) = self.kill.lock().take() {
            let _ = kill.send(());
        }
        self.closed().await;
        Ok(())
    }

    async fn closed(&self) {
        let mut exited = self.exited.clone();
        let _ = exited.wait_for(|done| *done).await;
    }
}

//! Install and invoke event protocol.
//!
//! Every event travelling between a plugin backend, the daemon and the
//! request originator has the same envelope:
//!
//! ```json
//! {"event": "log" | "session" | "error", "session_id": "...", "data": {...}}
//! ```
//!
//! `data` is opaque until dispatched on `event`; session events carry a
//! nested `{"type": "stream" | "end" | "invoke", "data": ...}` message.

use futures::future;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Live stream of events for one request.
pub type EventStream = BoxStream<'static, PluginUniversalEvent>;

/// Envelope kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Log,
    Session,
    Error,
}

/// Log severity carried by `log` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Payload of a `log` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginLogEvent {
    pub level: LogLevel,
    pub message: String,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

/// Session message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMessageType {
    /// Incremental output chunk.
    Stream,
    /// Terminal message; nothing follows on this session.
    End,
    /// Reverse invocation requested by the plugin.
    Invoke,
}

/// Payload of a `session` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    #[serde(rename = "type")]
    pub kind: SessionMessageType,
    #[serde(default)]
    pub data: Value,
}

/// The event envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginUniversalEvent {
    pub event: EventKind,
    pub session_id: String,
    #[serde(default)]
    pub data: Value,
}

fn now_seconds() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

impl PluginUniversalEvent {
    /// A `log` event stamped with the current time.
    pub fn log(session_id: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        let payload = PluginLogEvent { level, message: message.into(), timestamp: now_seconds() };
        Self {
            event: EventKind::Log,
            session_id: session_id.into(),
            data: serde_json::to_value(payload).unwrap_or_default(),
        }
    }

    /// A `session` event with the given message.
    pub fn session(session_id: impl Into<String>, message: SessionMessage) -> Self {
        Self {
            event: EventKind::Session,
            session_id: session_id.into(),
            data: serde_json::to_value(message).unwrap_or_default(),
        }
    }

    /// A `session/stream` event.
    pub fn stream(session_id: impl Into<String>, data: Value) -> Self {
        Self::session(session_id, SessionMessage { kind: SessionMessageType::Stream, data })
    }

    /// A terminal `session/end` event.
    pub fn end(session_id: impl Into<String>, data: Value) -> Self {
        Self::session(session_id, SessionMessage { kind: SessionMessageType::End, data })
    }

    /// An `error` event.
    pub fn error(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            event: EventKind::Error,
            session_id: session_id.into(),
            data: serde_json::json!({ "message": message.into() }),
        }
    }

    /// Decode the log payload.
    pub fn as_log(&self) -> Option<PluginLogEvent> {
        if self.event != EventKind::Log {
            return None;
        }
        serde_json::from_value(self.data.clone()).ok()
    }

    /// Decode the session payload.
    pub fn as_session(&self) -> Option<SessionMessage> {
        if self.event != EventKind::Session {
            return None;
        }
        serde_json::from_value(self.data.clone()).ok()
    }

    /// Whether this event terminates its session.
    pub fn is_end(&self) -> bool {
        self.as_session().is_some_and(|m| m.kind == SessionMessageType::End)
    }

    /// Parse one line of newline-delimited JSON.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }

    /// Serialize as one line of newline-delimited JSON (without the newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Turn a broadcast subscription into an [`EventStream`].
///
/// Lagged gaps are skipped and the stream ends after the first `end` event
/// or when every sender is gone.
pub fn broadcast_stream(rx: broadcast::Receiver<PluginUniversalEvent>) -> EventStream {
    BroadcastStream::new(rx)
        .filter_map(|item| future::ready(item.ok()))
        .scan(false, |finished, event| {
            if *finished {
                return future::ready(None);
            }
            *finished = event.is_end();
            future::ready(Some(event))
        })
        .boxed()
}

/// Push side of a request's event stream.
///
/// Emitting never blocks and never fails: when nobody listens any more the
/// event is dropped, which is how consumers disconnect without affecting the
/// work producing the events.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    session_id: String,
    tx: broadcast::Sender<PluginUniversalEvent>,
}

impl ProgressSink {
    /// Capacity of the broadcast buffer behind a sink.
    pub const BUFFER: usize = 256;

    /// Create a sink publishing into `tx`.
    pub fn new(session_id: impl Into<String>, tx: broadcast::Sender<PluginUniversalEvent>) -> Self {
        Self { session_id: session_id.into(), tx }
    }

    /// Create a sink with a fresh channel and no subscribers.
    pub fn detached(session_id: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(Self::BUFFER);
        Self::new(session_id, tx)
    }

    /// Session this sink publishes for.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Subscribe to everything emitted from now on.
    pub fn subscribe(&self) -> EventStream {
        broadcast_stream(self.tx.subscribe())
    }

    /// Publish an event.
    pub fn emit(&self, event: PluginUniversalEvent) {
        let _ = self.tx.send(event);
    }

    /// Publish a `log` event for this session.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(PluginUniversalEvent::log(self.session_id.clone(), level, message));
    }

    /// Publish the terminal `end` event for this session.
    pub fn end(&self, data: Value) {
        self.emit(PluginUniversalEvent::end(self.session_id.clone(), data));
    }
}

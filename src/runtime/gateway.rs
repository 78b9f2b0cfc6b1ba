//! Invocation gateway: the transport that carries invoke requests to a
//! backend that does not live in this process.
//!
//! Responses are newline-delimited [`PluginUniversalEvent`]s.

use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::{Client, StatusCode};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::core::InnerApiConfig;
use crate::plugin::{
    EventStream, InvokeRequest, PluginError, PluginResult, PluginUniqueIdentifier,
    PluginUniversalEvent, RunningLocation, RuntimeKind,
};

/// Header carrying the shared cluster key.
pub const API_KEY_HEADER: &str = "X-Api-Key";

/// Header naming the plugin an invocation is for.
pub const PLUGIN_HEADER: &str = "X-Plugin-Identifier";

/// Opaque transport to a remote or serverless backend.
#[async_trait]
pub trait InvocationGateway: Send + Sync {
    async fn invoke(
        &self,
        identity: &PluginUniqueIdentifier,
        location: &RunningLocation,
        request: InvokeRequest,
    ) -> PluginResult<EventStream>;
}

/// HTTP gateway.
///
/// Serverless functions are called at `<target>/invoke`; plugins hosted by
/// another node are reached through that node's `/plugin/invoke` endpoint.
pub struct HttpGateway {
    client: Client,
    inner_api: InnerApiConfig,
    function_key: String,
}

impl HttpGateway {
    pub fn new(inner_api: InnerApiConfig, function_key: impl Into<String>) -> PluginResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| PluginError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, inner_api, function_key: function_key.into() })
    }

    fn endpoint(&self, location: &RunningLocation) -> (String, &str) {
        match location.runtime {
            RuntimeKind::Serverless => {
                let url = format!("{}/invoke", location.target.trim_end_matches('/'));
                (url, self.function_key.as_str())
            }
            RuntimeKind::Local | RuntimeKind::Remote => {
                let base = if location.node_address.is_empty() {
                    &self.inner_api.url
                } else {
                    &location.node_address
                };
                let url = format!("{}/plugin/invoke", base.trim_end_matches('/'));
                (url, self.inner_api.key.as_str())
            }
        }
    }
}

#[async_trait]
impl InvocationGateway for HttpGateway {
    async fn invoke(
        &self,
        identity: &PluginUniqueIdentifier,
        location: &RunningLocation,
        request: InvokeRequest,
    ) -> PluginResult<EventStream> {
        let (url, key) = self.endpoint(location);
        tracing::debug!(
            identity = %identity,
            url = %url,
            session = %request.session_id,
            "Forwarding invocation"
        );

        let response = self
            .client
            .post(&url)
            .header(API_KEY_HEADER, key)
            .header(PLUGIN_HEADER, identity.as_str())
            .json(&request)
            .send()
            .await
            .map_err(|e| PluginError::Invocation(format!("{url}: {e}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(PluginError::NotFound(identity.clone()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PluginError::Invocation(format!("{url} returned {status}: {body}")));
        }

        Ok(ndjson_events(request.session_id, response.bytes_stream()))
    }
}

/// Decode a newline-delimited JSON byte stream into events.
///
/// Lines that are not events are skipped. If the body ends (or fails)
/// before an `end` event, an `error` and a closing `end` are appended so
/// consumers always see a terminal event.
pub fn ndjson_events<S, B, E>(session_id: String, body: S) -> EventStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send,
{
    let (tx, rx) = mpsc::channel(64);

    tokio::spawn(async move {
        let mut body = std::pin::pin!(body);
        let mut buffer: Vec<u8> = Vec::new();
        let mut ended = false;
        let mut failure = None;

        'read: while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    failure = Some(e.to_string());
                    break;
                }
            };
            buffer.extend_from_slice(chunk.as_ref());

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                if let Some(event) = parse_line(&line) {
                    ended = event.is_end();
                    if tx.send(event).await.is_err() || ended {
                        break 'read;
                    }
                }
            }
        }

        if !ended && failure.is_none() {
            if let Some(event) = parse_line(&buffer) {
                ended = event.is_end();
                let _ = tx.send(event).await;
            }
        }

        if !ended {
            let reason = failure.unwrap_or_else(|| "response ended before session end".to_string());
            let _ = tx.send(PluginUniversalEvent::error(session_id.clone(), reason)).await;
            let _ = tx.send(PluginUniversalEvent::end(session_id, serde_json::Value::Null)).await;
        }
    });

    ReceiverStream::new(rx).boxed()
}

fn parse_line(line: &[u8]) -> Option<PluginUniversalEvent> {
    let text = std::str::from_utf8(line).ok()?.trim();
    if text.is_empty() {
        return None;
    }
    match PluginUniversalEvent::from_line(text) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::debug!(error = %e, "Skipping undecodable response line");
            None
        }
    }
}

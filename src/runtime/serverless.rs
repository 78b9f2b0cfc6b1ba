//! Serverless execution: plugins deployed as functions on an external
//! platform and invoked through the gateway.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::{InvocationGateway, RuntimeBackend, API_KEY_HEADER};
use crate::cluster::NodeInfo;
use crate::core::ServerlessConfig;
use crate::plugin::{
    BackendError, EventStream, InvokeRequest, LogLevel, PackageDescriptor, PluginError,
    PluginLifetime, PluginResult, PluginUniqueIdentifier, ProgressSink, RunningLocation,
    RuntimeKind,
};

/// A deployed function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRef {
    pub name: String,
    pub url: String,
}

/// Function deployment API of an execution platform.
#[async_trait]
pub trait FunctionPlatform: Send + Sync {
    async fn deploy(&self, package: &PackageDescriptor) -> Result<FunctionRef, BackendError>;

    async fn undeploy(&self, function: &FunctionRef) -> Result<(), BackendError>;
}

#[derive(Serialize)]
struct DeployRequest<'a> {
    name: String,
    identifier: &'a str,
    memory_mb: u32,
    timeout_secs: u64,
}

/// [`FunctionPlatform`] over the platform's HTTP API.
///
/// Deployment creates the function with `POST /v1/functions`, then uploads
/// the package to `PUT /v1/functions/<name>/package`.
pub struct HttpFunctionPlatform {
    client: Client,
    url: String,
    key: String,
}

impl HttpFunctionPlatform {
    pub fn new(config: &ServerlessConfig) -> PluginResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| PluginError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            key: config.key.clone(),
        })
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, body))
    }
}

/// Function name for a plugin: DNS-safe and unique per identity.
pub fn function_name(identity: &PluginUniqueIdentifier) -> String {
    let checksum = identity.checksum();
    let raw = format!(
        "{}-{}-{}-{}",
        identity.author().unwrap_or("anon"),
        identity.name(),
        identity.version(),
        &checksum[..checksum.len().min(8)]
    );
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect()
}

fn classify_status(status: StatusCode, body: String) -> BackendError {
    let detail = format!("{status}: {body}");
    if status == StatusCode::TOO_MANY_REQUESTS {
        BackendError::QuotaExceeded(detail)
    } else if status.is_server_error() {
        BackendError::PlatformUnavailable(detail)
    } else {
        BackendError::SpawnFailed(detail)
    }
}

fn transport(e: &reqwest::Error) -> BackendError {
    BackendError::PlatformUnavailable(e.to_string())
}

#[async_trait]
impl FunctionPlatform for HttpFunctionPlatform {
    async fn deploy(&self, package: &PackageDescriptor) -> Result<FunctionRef, BackendError> {
        let request = DeployRequest {
            name: function_name(&package.identity),
            identifier: package.identity.as_str(),
            memory_mb: package.manifest.resources.memory_mb,
            timeout_secs: package.manifest.resources.timeout_secs,
        };

        let response = self
            .client
            .post(format!("{}/v1/functions", self.url))
            .header(API_KEY_HEADER, &self.key)
            .json(&request)
            .send()
            .await
            .map_err(|e| transport(&e))?;
        let function: FunctionRef =
            Self::check(response).await?.json().await.map_err(|e| transport(&e))?;

        let response = self
            .client
            .put(format!("{}/v1/functions/{}/package", self.url, function.name))
            .header(API_KEY_HEADER, &self.key)
            .body(package.archive.to_vec())
            .send()
            .await
            .map_err(|e| transport(&e))?;
        Self::check(response).await?;

        Ok(function)
    }

    async fn undeploy(&self, function: &FunctionRef) -> Result<(), BackendError> {
        let response = self
            .client
            .delete(format!("{}/v1/functions/{}", self.url, function.name))
            .header(API_KEY_HEADER, &self.key)
            .send()
            .await
            .map_err(|e| transport(&e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(response).await.map(|_| ())
    }
}

/// Backend deploying each plugin as a function.
pub struct ServerlessBackend {
    node: NodeInfo,
    platform: Arc<dyn FunctionPlatform>,
    gateway: Arc<dyn InvocationGateway>,
    deploy_timeout: Duration,
}

impl ServerlessBackend {
    pub fn new(
        node: NodeInfo,
        platform: Arc<dyn FunctionPlatform>,
        gateway: Arc<dyn InvocationGateway>,
        deploy_timeout: Duration,
    ) -> Self {
        Self { node, platform, gateway, deploy_timeout }
    }
}

#[async_trait]
impl RuntimeBackend for ServerlessBackend {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Serverless
    }

    async fn provision(
        &self,
        package: &PackageDescriptor,
        progress: &ProgressSink,
    ) -> PluginResult<Arc<dyn PluginLifetime>> {
        progress.log(LogLevel::Info, format!("Deploying {} as a function", package.identity));

        let function = tokio::time::timeout(self.deploy_timeout, self.platform.deploy(package))
            .await
            .map_err(|_| BackendError::DeployTimeout(self.deploy_timeout))??;

        progress.log(LogLevel::Info, format!("Function {} ready at {}", function.name, function.url));
        tracing::info!(
            identity = %package.identity,
            function = %function.name,
            "Function deployed"
        );

        let location = self.node.location(RuntimeKind::Serverless, function.url.clone());
        Ok(Arc::new(ServerlessLifetime::new(
            package.identity.clone(),
            location,
            function,
            self.platform.clone(),
            self.gateway.clone(),
        )))
    }
}

/// Handle over a deployed function.
pub struct ServerlessLifetime {
    identity: PluginUniqueIdentifier,
    location: RunningLocation,
    function: FunctionRef,
    platform: Arc<dyn FunctionPlatform>,
    gateway: Arc<dyn InvocationGateway>,
    undeployed: watch::Sender<bool>,
}

impl ServerlessLifetime {
    pub fn new(
        identity: PluginUniqueIdentifier,
        location: RunningLocation,
        function: FunctionRef,
        platform: Arc<dyn FunctionPlatform>,
        gateway: Arc<dyn InvocationGateway>,
    ) -> Self {
        let (undeployed, _) = watch::channel(false);
        Self { identity, location, function, platform, gateway, undeployed }
    }

    pub fn function(&self) -> &FunctionRef {
        &self.function
    }
}

#[async_trait]
impl PluginLifetime for ServerlessLifetime {
    fn identity(&self) -> &PluginUniqueIdentifier {
        &self.identity
    }

    fn runtime(&self) -> RuntimeKind {
        RuntimeKind::Serverless
    }

    fn location(&self) -> RunningLocation {
        self.location.clone()
    }

    async fn invoke(&self, request: InvokeRequest) -> PluginResult<EventStream> {
        if *self.undeployed.borrow() {
            let reason = format!("{} is undeployed", self.function.name);
            return Err(PluginError::Invocation(reason));
        }
        self.gateway.invoke(&self.identity, &self.location, request).await
    }

    async fn shutdown(&self) -> PluginResult<()> {
        if *self.undeployed.borrow() {
            return Ok(());
        }
        self.platform.undeploy(&self.function).await?;
        self.undeployed.send_replace(true);
        tracing::info!(
            identity = %self.identity,
            function = %self.function.name,
            "Function undeployed"
        );
        Ok(())
    }

    async fn closed(&self) {
        let mut undeployed = self.undeployed.subscribe();
        let _ = undeployed.wait_for(|done| *done).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::StreamExt;

    use super::*;
    use crate::plugin::{ManifestDecoder, PackageDecoder, PluginUniversalEvent};

    struct FakePlatform {
        delay: Duration,
        fail: Option<fn() -> BackendError>,
        undeploys: AtomicUsize,
    }

    #[async_trait]
    impl FunctionPlatform for FakePlatform {
        async fn deploy(&self, package: &PackageDescriptor) -> Result<FunctionRef, BackendError> {
            tokio::time::sleep(self.delay).await;
            if let Some(fail) = self.fail {
                return Err(fail());
            }
            let name = function_name(&package.identity);
            Ok(FunctionRef { url: format!("https://fn.test/{name}"), name })
        }

        async fn undeploy(&self, _function: &FunctionRef) -> Result<(), BackendError> {
            self.undeploys.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct EchoGateway;

    #[async_trait]
    impl InvocationGateway for EchoGateway {
        async fn invoke(
            &self,
            _identity: &PluginUniqueIdentifier,
            location: &RunningLocation,
            request: InvokeRequest,
        ) -> PluginResult<EventStream> {
            let end = PluginUniversalEvent::end(request.session_id, location.target.clone().into());
            Ok(futures::stream::iter(vec![end]).boxed())
        }
    }

    fn package() -> PackageDescriptor {
        ManifestDecoder
            .decode(b"[plugin]\nname = \"Weather_Tool\"\nversion = \"1.0\"\nauthor = \"acme\"\n")
            .unwrap()
    }

    fn backend(platform: Arc<FakePlatform>, timeout: Duration) -> ServerlessBackend {
        let node = NodeInfo::new("n", "http://n");
        ServerlessBackend::new(node, platform, Arc::new(EchoGateway), timeout)
    }

    fn platform(delay: Duration, fail: Option<fn() -> BackendError>) -> Arc<FakePlatform> {
        Arc::new(FakePlatform { delay, fail, undeploys: AtomicUsize::new(0) })
    }

    #[test]
    fn test_function_name_is_dns_safe() {
        let name = function_name(&package().identity);
        assert!(name.starts_with("acme-weather-tool-1-0-"));
        assert!(name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()),
            BackendError::QuotaExceeded(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, String::new()),
            BackendError::PlatformUnavailable(_)
        ));
    }

    #[tokio::test]
    async fn test_provision_invoke_shutdown() {
        let platform = platform(Duration::ZERO, None);
        let backend = backend(platform.clone(), Duration::from_secs(5));

        let lifetime = backend.provision(&package(), &ProgressSink::detached("p")).await.unwrap();
        assert_eq!(lifetime.runtime(), RuntimeKind::Serverless);
        assert!(lifetime.location().target.starts_with("https://fn.test/"));

        let request = InvokeRequest::new("run", serde_json::Value::Null);
        let events: Vec<_> = lifetime.invoke(request).await.unwrap().collect().await;
        assert!(events[0].is_end());

        lifetime.shutdown().await.unwrap();
        lifetime.shutdown().await.unwrap();
        lifetime.closed().await;
        assert_eq!(platform.undeploys.load(Ordering::SeqCst), 1);
        assert!(lifetime.invoke(InvokeRequest::new("run", serde_json::Value::Null)).await.is_err());
    }

    #[tokio::test]
    async fn test_deploy_timeout() {
        let backend = backend(platform(Duration::from_secs(5), None), Duration::from_millis(20));

        let err = backend.provision(&package(), &ProgressSink::detached("p")).await.err().unwrap();
        assert!(matches!(err, PluginError::Backend(BackendError::DeployTimeout(_))));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_quota_exceeded_propagates() {
        let fail: fn() -> BackendError = || BackendError::QuotaExceeded("limit".into());
        let backend = backend(platform(Duration::ZERO, Some(fail)), Duration::from_secs(5));

        let err = backend.provision(&package(), &ProgressSink::detached("p")).await.err().unwrap();
        assert!(matches!(err, PluginError::Backend(BackendError::QuotaExceeded(_))));
    }
}

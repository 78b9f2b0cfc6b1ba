//! Install Pipeline Integration Tests
//!
//! Drives installs and invocations through a full `DaemonContext` with a
//! fake runtime backend.

mod common;

use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;

use common::{eventually, manifest_toml, node, package, LoopbackGateway};
use plugind::cluster::{running_key, CoordinationStore, MemoryStore};
use plugind::plugin::{
    EventKind, InstallOutcome, InvokeRequest, LogLevel, PackageAsset, PluginError,
    SessionMessageType,
};

// ============================================================================
// Install Tests
// ============================================================================

mod install {
    use super::*;

    #[tokio::test]
    async fn test_install_then_invoke_locally() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let (context, backend) = node(dir.path(), "node-a", store.clone(), &Arc::default());
        let pkg = package("weather", "1.0.0");
        let identity = pkg.identity.clone();

        let outcome = InstallOutcome::from_stream(context.install(pkg).await.unwrap()).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.identity, identity);
        assert_eq!(backend.provisions(), 1);

        // Announced to the cluster.
        assert!(store.get(&running_key(&identity)).await.unwrap().is_some());

        let request = InvokeRequest::new("forecast", json!({ "city": "Oslo" }));
        let events: Vec<_> = context.invoke(&identity, request).await.unwrap().collect().await;

        assert_eq!(events.len(), 2);
        let chunk = events[0].as_session().unwrap();
        assert_eq!(chunk.kind, SessionMessageType::Stream);
        assert_eq!(chunk.data["echo"]["city"], "Oslo");
        assert!(events[1].is_end());
    }

    #[tokio::test]
    async fn test_install_raw_decodes_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let (context, _) = node(dir.path(), "node-a", Arc::new(MemoryStore::new()), &Arc::default());
        let raw = manifest_toml("search", "2.1.0");

        let stream = context.install_raw(raw.as_bytes()).await.unwrap();
        let outcome = InstallOutcome::from_stream(stream).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.identity.name(), "search");
        assert_eq!(outcome.identity.version(), "2.1.0");
        assert_eq!(outcome.identity, package("search", "2.1.0").identity);
    }

    #[tokio::test]
    async fn test_events_end_with_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let (context, _) = node(dir.path(), "node-a", Arc::new(MemoryStore::new()), &Arc::default());

        let events: Vec<_> =
            context.install(package("weather", "1.0.0")).await.unwrap().collect().await;

        let logs: Vec<_> = events.iter().filter_map(|e| e.as_log()).collect();
        assert!(logs.iter().any(|log| log.message == "provisioning"));
        assert!(logs.iter().all(|log| log.level == LogLevel::Info));

        let ends = events.iter().filter(|e| e.is_end()).count();
        assert_eq!(ends, 1);
        assert!(events.last().unwrap().is_end());
        assert!(events.iter().all(|e| e.event != EventKind::Error));
    }

    #[tokio::test]
    async fn test_oversized_package_never_provisions() {
        let dir = tempfile::tempdir().unwrap();
        let (context, backend) =
            node(dir.path(), "node-a", Arc::new(MemoryStore::new()), &Arc::default());
        let mut pkg = package("weather", "1.0.0");
        pkg.size = context.config().daemon.max_package_size + 1;

        let events: Vec<_> = context.install(pkg).await.unwrap().collect().await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_log().unwrap().level, LogLevel::Error);
        assert!(events[1].is_end());
        assert_eq!(backend.provisions(), 0);
        assert!(context.registry().is_empty());
    }

    #[tokio::test]
    async fn test_assets_are_stored() {
        let dir = tempfile::tempdir().unwrap();
        let (context, _) = node(dir.path(), "node-a", Arc::new(MemoryStore::new()), &Arc::default());
        let pkg = package("weather", "1.0.0").with_assets(vec![PackageAsset {
            name: "icon.svg".to_string(),
            bytes: b"<svg/>".to_vec(),
        }]);

        let outcome = InstallOutcome::from_stream(context.install(pkg).await.unwrap()).await.unwrap();
        assert!(outcome.success);

        assert_eq!(context.media().cache().len(), 1);
        let id = format!("{}.svg", plugind::plugin::package_checksum(b"<svg/>"));
        assert_eq!(context.media().get(&id).await.unwrap().unwrap(), b"<svg/>");
    }

    #[tokio::test]
    async fn test_invoke_unknown_plugin() {
        let dir = tempfile::tempdir().unwrap();
        let (context, _) = node(dir.path(), "node-a", Arc::new(MemoryStore::new()), &Arc::default());
        let identity = package("ghost", "0.0.1").identity;

        let result = context.invoke(&identity, InvokeRequest::new("x", json!(null))).await;
        assert!(matches!(result, Err(PluginError::NotFound(_))));
    }
}

// ============================================================================
// Concurrency Tests
// ============================================================================

mod concurrency {
    use super::*;

    #[tokio::test]
    async fn test_concurrent_installs_provision_once() {
        let dir = tempfile::tempdir().unwrap();
        let (context, backend) =
            node(dir.path(), "node-a", Arc::new(MemoryStore::new()), &Arc::default());

        let installs = (0..8).map(|_| {
            let context = context.clone();
            tokio::spawn(async move {
                let stream = context.install(package("weather", "1.0.0")).await.unwrap();
                InstallOutcome::from_stream(stream).await.unwrap()
            })
        });
        let outcomes = futures::future::join_all(installs).await;

        for outcome in outcomes {
            assert!(outcome.unwrap().success);
        }
        assert_eq!(backend.provisions(), 1);
        assert_eq!(context.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_dropping_stream_does_not_cancel_install() {
        let dir = tempfile::tempdir().unwrap();
        let (context, backend) =
            node(dir.path(), "node-a", Arc::new(MemoryStore::new()), &Arc::default());
        let pkg = package("weather", "1.0.0");
        let identity = pkg.identity.clone();

        drop(context.install(pkg).await.unwrap());

        eventually(|| context.registry().contains(&identity)).await;
        assert_eq!(backend.provisions(), 1);
        eventually(|| context.pipeline().in_flight() == 0).await;
    }

    #[tokio::test]
    async fn test_distinct_versions_install_independently() {
        let dir = tempfile::tempdir().unwrap();
        let (context, backend) =
            node(dir.path(), "node-a", Arc::new(MemoryStore::new()), &Arc::default());

        let (a, b) = tokio::join!(
            context.install(package("weather", "1.0.0")),
            context.install(package("weather", "2.0.0"))
        );
        let (a, b) = tokio::join!(
            InstallOutcome::from_stream(a.unwrap()),
            InstallOutcome::from_stream(b.unwrap())
        );

        assert_ne!(a.unwrap().identity, b.unwrap().identity);
        assert_eq!(backend.provisions(), 2);
        assert_eq!(context.registry().len(), 2);
    }
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_crashed_plugin_is_unregistered() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let (context, backend) = node(dir.path(), "node-a", store.clone(), &Arc::default());
        let pkg = package("weather", "1.0.0");
        let identity = pkg.identity.clone();

        InstallOutcome::from_stream(context.install(pkg).await.unwrap()).await.unwrap();
        backend.last_lifetime().unwrap().crash();

        eventually(|| !context.registry().contains(&identity)).await;
        let key = running_key(&identity);
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while store.get(&key).await.unwrap().is_some() {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // A reinstall provisions again.
        let outcome =
            InstallOutcome::from_stream(context.install(package("weather", "1.0.0")).await.unwrap())
                .await
                .unwrap();
        assert!(!outcome.already_running);
        assert_eq!(backend.provisions(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_every_plugin() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(LoopbackGateway::default());
        let (context, backend) = node(dir.path(), "node-a", Arc::new(MemoryStore::new()), &gateway);

        for version in ["1.0.0", "1.1.0"] {
            let stream = context.install(package("weather", version)).await.unwrap();
            InstallOutcome::from_stream(stream).await.unwrap();
        }
        let last = backend.last_lifetime().unwrap();

        context.shutdown().await;

        assert!(context.registry().is_empty());
        assert!(last.is_stopped());
    }
}

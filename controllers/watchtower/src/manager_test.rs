//! Lifecycle and end-to-end tests for the watcher manager

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use crate::cluster::Cluster;
    use crate::manager::WatcherManager;
    use crate::template::TemplateEngine;
    use crate::test_utils::*;
    use crds::{
        Destination, Filter, LifecyclePolicy, Source, ValuesFrom, ValuesFromKind, Watcher,
        WatcherSpec, FINALIZER,
    };

    fn manager_for(cluster: &Arc<FakeCluster>) -> Arc<WatcherManager> {
        let cluster_dyn: Arc<dyn Cluster> = cluster.clone();
        let templates = Arc::new(TemplateEngine::new(cluster_dyn.clone()));
        Arc::new(WatcherManager::new(cluster_dyn, templates))
    }

    fn secret_watcher(uid: &str, url_template: &str) -> Watcher {
        test_watcher(
            uid,
            WatcherSpec {
                source: Source {
                    api_version: "v1".to_string(),
                    kind: "Secret".to_string(),
                    ..Default::default()
                },
                filter: Filter::default(),
                destination: http_destination(url_template, "{{ object.data.k }}", ""),
                values_from: Vec::new(),
            },
        )
    }

    fn secret(name: &str, uid: &str, value: &str) -> kube::api::DynamicObject {
        let mut object = test_object("v1", "Secret", "default", name, uid);
        object.data = json!({"data": {"k": value}});
        object
    }

    async fn eventually<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_add_registers_runtime_once_per_uid() {
        let cluster = FakeCluster::new();
        let manager = manager_for(&cluster);
        let watcher = secret_watcher("uid-1", "http://127.0.0.1:9/hook");

        manager.add(&watcher).await;
        manager.add(&watcher).await;

        assert_eq!(manager.len(), 1);
        assert_eq!(cluster.informer_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_adds_register_single_runtime() {
        let server = TestServer::start(&[]).await;
        let cluster = FakeCluster::new();
        let manager = manager_for(&cluster);
        let watcher = secret_watcher("uid-1", &server.url("/{{ object.metadata.name }}"));

        let adds: Vec<_> = (0..4)
            .map(|_| {
                let manager = manager.clone();
                let watcher = watcher.clone();
                tokio::spawn(async move { manager.add(&watcher).await })
            })
            .collect();
        for add in adds {
            add.await.unwrap();
        }

        assert_eq!(manager.len(), 1);
        assert_eq!(cluster.informer_count(), 1);

        // exactly one runtime dispatches; a leaked duplicate would double up
        cluster.put(&secret_gvk(), secret("solo", "obj-1", "dmFsdWU="));
        assert!(server.wait_for_requests(1, Duration::from_secs(3)).await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(server.request_count(), 1);

        // and the registered runtime is reachable by remove
        manager.remove(&watcher).await;
        assert_eq!(manager.len(), 0);
        assert_eq!(cluster.informer_count(), 0);
    }

    #[tokio::test]
    async fn test_add_without_destination_is_rejected() {
        let cluster = FakeCluster::new();
        let manager = manager_for(&cluster);
        let mut watcher = secret_watcher("uid-1", "http://127.0.0.1:9/hook");
        watcher.spec.destination = Destination::default();

        manager.add(&watcher).await;

        assert_eq!(manager.len(), 0);
        assert_eq!(cluster.informer_count(), 0);
    }

    #[tokio::test]
    async fn test_add_with_unresolvable_values_is_rejected() {
        let cluster = FakeCluster::new();
        let manager = manager_for(&cluster);
        let mut watcher = secret_watcher("uid-1", "http://127.0.0.1:9/hook");
        watcher.spec.values_from = vec![ValuesFrom {
            kind: ValuesFromKind::ConfigMap,
            name: "absent".to_string(),
            key: "w".to_string(),
        }];

        manager.add(&watcher).await;

        assert_eq!(manager.len(), 0);
    }

    #[tokio::test]
    async fn test_informer_shared_until_last_watcher_removed() {
        let cluster = FakeCluster::new();
        let manager = manager_for(&cluster);
        let first = secret_watcher("uid-1", "http://127.0.0.1:9/hook");
        let second = secret_watcher("uid-2", "http://127.0.0.1:9/hook");

        manager.add(&first).await;
        manager.add(&second).await;
        assert_eq!(cluster.informer_count(), 1);

        manager.remove(&first).await;
        assert_eq!(cluster.informer_count(), 1, "informer still has a watcher");

        manager.remove(&second).await;
        assert_eq!(cluster.informer_count(), 0);
        assert_eq!(cluster.removed_informers(), vec!["/v1/Secret".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_absent_watcher_is_noop() {
        let cluster = FakeCluster::new();
        let manager = manager_for(&cluster);
        manager.remove(&secret_watcher("uid-1", "http://127.0.0.1:9/hook")).await;
        assert_eq!(manager.len(), 0);
    }

    #[tokio::test]
    async fn test_create_event_notifies_destination() {
        let server = TestServer::start(&[]).await;
        let cluster = FakeCluster::new();
        let manager = manager_for(&cluster);

        manager
            .add(&secret_watcher("uid-1", &server.url("/{{ object.metadata.name }}")))
            .await;
        cluster.put(&secret_gvk(), secret("my-secret", "obj-1", "dmFsdWU="));

        assert!(server.wait_for_requests(1, Duration::from_secs(3)).await);
        let requests = server.requests();
        assert_eq!(requests[0].method, "POST");
        assert_eq!(requests[0].path, "/my-secret");
        assert_eq!(requests[0].body, "dmFsdWU=");
    }

    #[tokio::test]
    async fn test_watcher_sees_objects_created_before_add() {
        let server = TestServer::start(&[]).await;
        let cluster = FakeCluster::new();
        let manager = manager_for(&cluster);

        cluster.put(&secret_gvk(), secret("early", "obj-1", "dmFsdWU="));
        manager
            .add(&secret_watcher("uid-1", &server.url("/{{ object.metadata.name }}")))
            .await;

        assert!(server.wait_for_requests(1, Duration::from_secs(3)).await);
        assert_eq!(server.requests()[0].path, "/early");
    }

    #[tokio::test]
    async fn test_failed_dispatch_retries_with_backoff() {
        let server = TestServer::start(&[500, 500, 500]).await;
        let cluster = FakeCluster::new();
        let manager = manager_for(&cluster);

        manager.add(&secret_watcher("uid-1", &server.url("/hook"))).await;
        cluster.put(&secret_gvk(), secret("my-secret", "obj-1", "dmFsdWU="));

        assert!(server.wait_for_requests(4, Duration::from_secs(5)).await);
        let requests = server.requests();
        assert_eq!(requests.len(), 4);

        let gaps: Vec<Duration> = requests
            .windows(2)
            .map(|pair| pair[1].at.duration_since(pair[0].at))
            .collect();
        assert!(gaps[0] >= Duration::from_millis(100), "first retry too early: {gaps:?}");
        assert!(gaps[1] >= Duration::from_millis(200), "second retry too early: {gaps:?}");
        assert!(gaps[2] >= Duration::from_millis(400), "third retry too early: {gaps:?}");

        // success drained the queue; nothing else arrives
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(server.request_count(), 4);
    }

    #[tokio::test]
    async fn test_removed_watcher_processes_nothing_more() {
        let kept_server = TestServer::start(&[]).await;
        let removed_server = TestServer::start(&[]).await;
        let cluster = FakeCluster::new();
        let manager = manager_for(&cluster);

        let kept = secret_watcher("uid-keep", &kept_server.url("/{{ object.metadata.name }}"));
        let removed = secret_watcher("uid-gone", &removed_server.url("/{{ object.metadata.name }}"));
        manager.add(&kept).await;
        manager.add(&removed).await;

        manager.remove(&removed).await;
        cluster.put(&secret_gvk(), secret("after-remove", "obj-1", "dmFsdWU="));

        assert!(kept_server.wait_for_requests(1, Duration::from_secs(3)).await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(removed_server.request_count(), 0);
    }

    #[tokio::test]
    async fn test_worker_pool_respects_concurrency_bound() {
        let delay = Duration::from_millis(150);
        let server = TestServer::start_with_delay(&[], delay).await;
        let cluster = FakeCluster::new();
        let manager = manager_for(&cluster);

        manager
            .add(&secret_watcher("uid-1", &server.url("/{{ object.metadata.name }}")))
            .await;
        cluster.put(&secret_gvk(), secret("a", "obj-a", "x"));
        cluster.put(&secret_gvk(), secret("b", "obj-b", "x"));

        assert!(server.wait_for_requests(2, Duration::from_secs(3)).await);
        let requests = server.requests();
        let gap = requests[1].at.duration_since(requests[0].at);
        assert!(gap >= delay, "one worker must serialize dispatches, gap was {gap:?}");
    }

    #[tokio::test]
    async fn test_concurrent_workers_overlap() {
        let delay = Duration::from_millis(150);
        let server = TestServer::start_with_delay(&[], delay).await;
        let cluster = FakeCluster::new();
        let manager = manager_for(&cluster);

        let mut watcher = secret_watcher("uid-1", &server.url("/{{ object.metadata.name }}"));
        watcher.spec.source.concurrency = Some(2);
        manager.add(&watcher).await;
        cluster.put(&secret_gvk(), secret("a", "obj-a", "x"));
        cluster.put(&secret_gvk(), secret("b", "obj-b", "x"));

        assert!(server.wait_for_requests(2, Duration::from_secs(3)).await);
        let requests = server.requests();
        let gap = requests[1].at.duration_since(requests[0].at);
        assert!(gap < delay, "two workers should overlap, gap was {gap:?}");
    }

    #[tokio::test]
    async fn test_update_events_follow_generation_by_default() {
        let server = TestServer::start(&[]).await;
        let cluster = FakeCluster::new();
        let manager = manager_for(&cluster);

        manager.add(&secret_watcher("uid-1", &server.url("/hook"))).await;
        let mut object = secret("my-secret", "obj-1", "dmFsdWU=");
        cluster.put(&secret_gvk(), object.clone());
        assert!(server.wait_for_requests(1, Duration::from_secs(3)).await);

        // status-only churn: resourceVersion moves, generation does not
        object.metadata.resource_version = Some("7".to_string());
        cluster.put(&secret_gvk(), object.clone());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(server.request_count(), 1);

        object.metadata.generation = Some(2);
        object.metadata.resource_version = Some("8".to_string());
        cluster.put(&secret_gvk(), object);
        assert!(server.wait_for_requests(2, Duration::from_secs(3)).await);
        assert_eq!(server.requests()[1].method, "PUT");
    }

    #[tokio::test]
    async fn test_values_from_decides_source_kind() {
        let server = TestServer::start(&[]).await;
        let cluster = FakeCluster::new();
        let manager = manager_for(&cluster);

        let mut values = test_object("v1", "ConfigMap", "default", "values", "cm-uid");
        values.data = json!({"data": {"watcher": "spec:\n  source:\n    kind: Secret\n"}});
        cluster.put(
            &kube::api::GroupVersionKind::gvk("", "v1", "ConfigMap"),
            values,
        );

        let mut watcher = secret_watcher("uid-1", &server.url("/{{ object.metadata.name }}"));
        watcher.spec.source.kind = String::new(); // the reference supplies it
        watcher.spec.values_from = vec![ValuesFrom {
            kind: ValuesFromKind::ConfigMap,
            name: "values".to_string(),
            key: "watcher".to_string(),
        }];
        manager.add(&watcher).await;
        assert_eq!(manager.len(), 1);

        cluster.put(&secret_gvk(), secret("merged-kind", "obj-1", "dmFsdWU="));
        assert!(server.wait_for_requests(1, Duration::from_secs(3)).await);
        assert_eq!(server.requests()[0].path, "/merged-kind");
    }

    #[tokio::test]
    async fn test_update_replaces_runtime_and_informer() {
        let cluster = FakeCluster::new();
        let manager = manager_for(&cluster);

        let mut watcher = secret_watcher("uid-1", "http://127.0.0.1:9/hook");
        manager.add(&watcher).await;
        assert_eq!(cluster.informer_count(), 1);

        watcher.spec.source.kind = "ConfigMap".to_string();
        manager.update(&watcher).await;

        assert_eq!(manager.len(), 1);
        assert_eq!(cluster.informer_count(), 1);
        assert!(cluster.removed_informers().contains(&"/v1/Secret".to_string()));
    }

    #[tokio::test]
    async fn test_finalizer_lifecycle_end_to_end() {
        let server = TestServer::start(&[]).await;
        let cluster = FakeCluster::new();
        let manager = manager_for(&cluster);

        let mut watcher = secret_watcher("uid-1", &server.url("/hook"));
        watcher.spec.source.policies = vec![LifecyclePolicy::UseFinalizer];
        manager.add(&watcher).await;

        cluster.put(&secret_gvk(), secret("guarded", "obj-1", "dmFsdWU="));
        assert!(server.wait_for_requests(1, Duration::from_secs(3)).await);
        assert!(
            eventually(Duration::from_secs(3), || {
                cluster
                    .get_object(&secret_gvk(), Some("default"), "guarded")
                    .and_then(|object| object.metadata.finalizers)
                    .is_some_and(|finalizers| finalizers.contains(&FINALIZER.to_string()))
            })
            .await,
            "finalizer was not added"
        );

        // deletion arrives as an update carrying the termination marker
        cluster.begin_deletion(&secret_gvk(), Some("default"), "guarded");
        assert!(server.wait_for_requests(2, Duration::from_secs(3)).await);
        assert!(
            eventually(Duration::from_secs(3), || {
                cluster
                    .get_object(&secret_gvk(), Some("default"), "guarded")
                    .is_none()
            })
            .await,
            "post-flight did not release the object"
        );
    }
}

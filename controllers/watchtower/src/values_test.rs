//! Unit tests for valuesFrom resolution

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde_json::json;

    use crate::cluster::Cluster;
    use crate::error::Error;
    use crate::test_utils::*;
    use crate::values::{merge, resolve};
    use crds::{Source, ValuesFrom, ValuesFromKind, WatcherSpec};
    use kube::api::GroupVersionKind;

    fn configmap_gvk() -> GroupVersionKind {
        GroupVersionKind::gvk("", "v1", "ConfigMap")
    }

    fn watcher_with_values(values_from: Vec<ValuesFrom>) -> crds::Watcher {
        test_watcher(
            "watcher-uid",
            WatcherSpec {
                source: Source {
                    api_version: "v1".to_string(),
                    kind: String::new(),
                    ..Default::default()
                },
                filter: Default::default(),
                destination: http_destination("http://example", "", ""),
                values_from,
            },
        )
    }

    fn put_configmap(cluster: &Arc<FakeCluster>, name: &str, key: &str, value: &str) {
        let mut object = test_object("v1", "ConfigMap", "default", name, name);
        object.data = json!({"data": {}});
        object.data["data"][key] = json!(value);
        cluster.put(&configmap_gvk(), object);
    }

    #[tokio::test]
    async fn test_configmap_value_fills_blank_source_kind() {
        let cluster = FakeCluster::new();
        put_configmap(&cluster, "values", "watcher", "spec:\n  source:\n    kind: Pod\n");

        let watcher = watcher_with_values(vec![ValuesFrom {
            kind: ValuesFromKind::ConfigMap,
            name: "values".to_string(),
            key: "watcher".to_string(),
        }]);

        let cluster_dyn: Arc<dyn Cluster> = cluster.clone();
        let effective = resolve(&cluster_dyn, &watcher).await.unwrap();

        assert_eq!(effective.spec.source.kind, "Pod");
        // fields the fragment does not mention stay put
        assert_eq!(effective.spec.source.api_version, "v1");
        // the original is untouched
        assert_eq!(watcher.spec.source.kind, "");
    }

    #[tokio::test]
    async fn test_secret_values_are_base64_decoded() {
        let cluster = FakeCluster::new();
        let fragment = "spec:\n  destination:\n    http:\n      urlTemplate: http://merged\n";
        let mut secret = test_object("v1", "Secret", "default", "values", "values-uid");
        secret.data = json!({"data": {"watcher": BASE64.encode(fragment)}});
        cluster.put(&secret_gvk(), secret);

        let watcher = watcher_with_values(vec![ValuesFrom {
            kind: ValuesFromKind::Secret,
            name: "values".to_string(),
            key: "watcher".to_string(),
        }]);

        let cluster_dyn: Arc<dyn Cluster> = cluster.clone();
        let effective = resolve(&cluster_dyn, &watcher).await.unwrap();
        assert_eq!(
            effective.spec.destination.http.unwrap().url_template,
            "http://merged"
        );
    }

    #[tokio::test]
    async fn test_later_sources_win() {
        let cluster = FakeCluster::new();
        put_configmap(&cluster, "first", "w", "spec:\n  source:\n    kind: Pod\n    concurrency: 2\n");
        put_configmap(&cluster, "second", "w", "spec:\n  source:\n    kind: Deployment\n");

        let watcher = watcher_with_values(vec![
            ValuesFrom {
                kind: ValuesFromKind::ConfigMap,
                name: "first".to_string(),
                key: "w".to_string(),
            },
            ValuesFrom {
                kind: ValuesFromKind::ConfigMap,
                name: "second".to_string(),
                key: "w".to_string(),
            },
        ]);

        let cluster_dyn: Arc<dyn Cluster> = cluster.clone();
        let effective = resolve(&cluster_dyn, &watcher).await.unwrap();
        assert_eq!(effective.spec.source.kind, "Deployment");
        // survives from the first source
        assert_eq!(effective.spec.source.concurrency(), 2);
    }

    #[tokio::test]
    async fn test_missing_reference_is_fatal() {
        let cluster = FakeCluster::new();
        let watcher = watcher_with_values(vec![ValuesFrom {
            kind: ValuesFromKind::ConfigMap,
            name: "absent".to_string(),
            key: "w".to_string(),
        }]);

        let cluster_dyn: Arc<dyn Cluster> = cluster.clone();
        let err = resolve(&cluster_dyn, &watcher).await.unwrap_err();
        assert!(matches!(err, Error::ValuesFrom(_)));
    }

    #[tokio::test]
    async fn test_missing_key_is_fatal() {
        let cluster = FakeCluster::new();
        put_configmap(&cluster, "values", "other-key", "spec: {}\n");

        let watcher = watcher_with_values(vec![ValuesFrom {
            kind: ValuesFromKind::ConfigMap,
            name: "values".to_string(),
            key: "w".to_string(),
        }]);

        let cluster_dyn: Arc<dyn Cluster> = cluster.clone();
        let err = resolve(&cluster_dyn, &watcher).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_merge_maps_key_wise() {
        let mut target = json!({"a": {"b": 1, "c": 2}, "keep": true});
        merge(&mut target, &json!({"a": {"b": 9}}));
        assert_eq!(target, json!({"a": {"b": 9, "c": 2}, "keep": true}));
    }

    #[test]
    fn test_merge_null_never_overrides() {
        let mut target = json!({"a": 1});
        merge(&mut target, &json!({"a": null, "b": null}));
        assert_eq!(target, json!({"a": 1}));
    }

    #[test]
    fn test_merge_replaces_arrays() {
        let mut target = json!({"a": [1, 2, 3]});
        merge(&mut target, &json!({"a": [9]}));
        assert_eq!(target["a"], json!([9]));
    }
}

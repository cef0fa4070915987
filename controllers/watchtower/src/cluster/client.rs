//! kube-backed cluster implementation.
//!
//! Each kind gets one watch task feeding a [`SharedInformer`]. The watch
//! stream is restarted on the configured sync period to force a relist, which
//! stands in for client-go's resync.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, PostParams};
use kube::discovery::{self, Scope};
use kube::Client;
use kube_runtime::{watcher, WatchStreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{gvk_key, Cluster, ClusterError, SharedInformer};

struct InformerEntry {
    informer: Arc<SharedInformer>,
    task: JoinHandle<()>,
    synced: watch::Receiver<bool>,
}

impl Drop for InformerEntry {
    fn drop(&mut self) {
        self.task.abort();
    }
}

type ResolvedResource = (ApiResource, bool);

pub struct KubeCluster {
    client: Client,
    namespace: Option<String>,
    sync_period: Duration,
    informers: Arc<DashMap<String, InformerEntry>>,
    resources: Arc<DashMap<String, ResolvedResource>>,
}

impl KubeCluster {
    pub fn new(client: Client, namespace: Option<String>, sync_period: Duration) -> Arc<Self> {
        Arc::new(Self {
            client,
            namespace,
            sync_period,
            informers: Arc::new(DashMap::new()),
            resources: Arc::new(DashMap::new()),
        })
    }

    fn api(&self, resource: &ApiResource, namespaced: bool, namespace: Option<&str>) -> Api<DynamicObject> {
        api_for(&self.client, self.namespace.as_deref(), resource, namespaced, namespace)
    }
}

fn api_for(
    client: &Client,
    scoped_namespace: Option<&str>,
    resource: &ApiResource,
    namespaced: bool,
    namespace: Option<&str>,
) -> Api<DynamicObject> {
    match (namespaced, namespace.or(scoped_namespace)) {
        (true, Some(namespace)) => Api::namespaced_with(client.clone(), namespace, resource),
        _ => Api::all_with(client.clone(), resource),
    }
}

async fn resolve(
    client: &Client,
    resources: &DashMap<String, ResolvedResource>,
    gvk: &GroupVersionKind,
) -> Result<ResolvedResource, ClusterError> {
    let key = gvk_key(gvk);
    if let Some(hit) = resources.get(&key) {
        return Ok(hit.value().clone());
    }
    let (resource, capabilities) = discovery::pinned_kind(client, gvk)
        .await
        .map_err(|err| ClusterError::Discovery(key.clone(), err.to_string()))?;
    let resolved = (resource, matches!(capabilities.scope, Scope::Namespaced));
    resources.insert(key, resolved.clone());
    Ok(resolved)
}

fn start_informer(
    client: &Client,
    scoped_namespace: Option<&str>,
    sync_period: Duration,
    gvk: &GroupVersionKind,
    resource: &ApiResource,
    namespaced: bool,
) -> InformerEntry {
    let informer = SharedInformer::new(gvk.clone());
    let (synced_tx, synced_rx) = watch::channel(false);
    let api = api_for(client, scoped_namespace, resource, namespaced, None);
    let task = tokio::spawn(run_watch(api, informer.clone(), synced_tx, sync_period));
    InformerEntry {
        informer,
        task,
        synced: synced_rx,
    }
}

async fn run_watch(
    api: Api<DynamicObject>,
    informer: Arc<SharedInformer>,
    synced: watch::Sender<bool>,
    sync_period: Duration,
) {
    let source = gvk_key(informer.gvk());
    loop {
        let stream = watcher(api.clone(), watcher::Config::default()).default_backoff();
        let mut stream = std::pin::pin!(stream);
        let deadline = tokio::time::sleep(sync_period);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                () = &mut deadline => {
                    debug!(source = %source, "Sync period elapsed, relisting");
                    break;
                }
                event = stream.next() => match event {
                    Some(Ok(watcher::Event::Init)) => informer.begin_relist(),
                    Some(Ok(watcher::Event::InitApply(object))) => informer.apply(object),
                    Some(Ok(watcher::Event::InitDone)) => {
                        informer.end_relist();
                        let _ = synced.send(true);
                    }
                    Some(Ok(watcher::Event::Apply(object))) => informer.apply(object),
                    Some(Ok(watcher::Event::Delete(object))) => informer.delete(object),
                    Some(Err(err)) => {
                        warn!(source = %source, error = %err, "Watch stream error");
                    }
                    None => break,
                }
            }
        }
    }
}

async fn wait_synced(synced: &mut watch::Receiver<bool>, key: &str) -> Result<(), ClusterError> {
    while !*synced.borrow_and_update() {
        synced
            .changed()
            .await
            .map_err(|_| ClusterError::SyncFailed(key.to_string()))?;
    }
    Ok(())
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn informer(&self, gvk: &GroupVersionKind) -> Result<Arc<SharedInformer>, ClusterError> {
        let key = gvk_key(gvk);
        let existing = self
            .informers
            .get(&key)
            .map(|entry| (entry.informer.clone(), entry.synced.clone()));
        if let Some((informer, mut synced)) = existing {
            wait_synced(&mut synced, &key).await?;
            return Ok(informer);
        }

        let (resource, namespaced) = resolve(&self.client, &self.resources, gvk).await?;
        let (informer, mut synced) = {
            let entry = self.informers.entry(key.clone()).or_insert_with(|| {
                start_informer(
                    &self.client,
                    self.namespace.as_deref(),
                    self.sync_period,
                    gvk,
                    &resource,
                    namespaced,
                )
            });
            (entry.informer.clone(), entry.synced.clone())
        };
        wait_synced(&mut synced, &key).await?;
        Ok(informer)
    }

    async fn remove_informer(&self, gvk: &GroupVersionKind) -> Result<(), ClusterError> {
        // the entry's Drop aborts the watch task
        self.informers.remove(&gvk_key(gvk));
        Ok(())
    }

    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject, ClusterError> {
        let key = gvk_key(gvk);
        let store_hit = self
            .informers
            .get(&key)
            .map(|entry| entry.informer.get(namespace, name));
        if let Some(hit) = store_hit {
            return hit
                .map(|object| (*object).clone())
                .ok_or_else(|| ClusterError::NotFound(object_ref(&key, namespace, name)));
        }

        let (resource, namespaced) = resolve(&self.client, &self.resources, gvk).await?;
        let api = self.api(&resource, namespaced, namespace);
        match api.get(name).await {
            Ok(object) => Ok(object),
            Err(err) => Err(map_not_found(err, object_ref(&key, namespace, name))),
        }
    }

    fn cached_get(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject, ClusterError> {
        let key = gvk_key(gvk);
        match self.informers.get(&key) {
            Some(entry) => entry
                .informer
                .get(namespace, name)
                .map(|object| (*object).clone())
                .ok_or_else(|| ClusterError::NotFound(object_ref(&key, namespace, name))),
            None => {
                self.warm_up(gvk);
                Err(ClusterError::CacheNotReady(key))
            }
        }
    }

    fn cached_list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>, ClusterError> {
        let key = gvk_key(gvk);
        match self.informers.get(&key) {
            Some(entry) => Ok(entry
                .informer
                .list(namespace)
                .into_iter()
                .map(|object| (*object).clone())
                .collect()),
            None => {
                self.warm_up(gvk);
                Err(ClusterError::CacheNotReady(key))
            }
        }
    }

    async fn update(
        &self,
        gvk: &GroupVersionKind,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError> {
        let key = gvk_key(gvk);
        let name = object.metadata.name.clone().unwrap_or_default();
        let namespace = object.metadata.namespace.as_deref();
        let (resource, namespaced) = resolve(&self.client, &self.resources, gvk).await?;
        let api = self.api(&resource, namespaced, namespace);
        api.replace(&name, &PostParams::default(), object)
            .await
            .map_err(|err| map_not_found(err, object_ref(&key, namespace, &name)))
    }

    async fn delete(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), ClusterError> {
        let key = gvk_key(gvk);
        let (resource, namespaced) = resolve(&self.client, &self.resources, gvk).await?;
        let api = self.api(&resource, namespaced, namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|err| map_not_found(err, object_ref(&key, namespace, name)))
    }
}

impl KubeCluster {
    /// Starts an informer for a kind in the background so the next store read
    /// can succeed; used by synchronous cache readers.
    fn warm_up(&self, gvk: &GroupVersionKind) {
        let client = self.client.clone();
        let namespace = self.namespace.clone();
        let sync_period = self.sync_period;
        let informers = self.informers.clone();
        let resources = self.resources.clone();
        let gvk = gvk.clone();
        tokio::spawn(async move {
            let key = gvk_key(&gvk);
            match resolve(&client, &resources, &gvk).await {
                Ok((resource, namespaced)) => {
                    informers.entry(key).or_insert_with(|| {
                        start_informer(
                            &client,
                            namespace.as_deref(),
                            sync_period,
                            &gvk,
                            &resource,
                            namespaced,
                        )
                    });
                }
                Err(err) => warn!(source = %key, error = %err, "Failed to warm up informer"),
            }
        });
    }
}

fn object_ref(kind: &str, namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(namespace) => format!("{kind} {namespace}/{name}"),
        None => format!("{kind} {name}"),
    }
}

fn map_not_found(err: kube::Error, what: String) -> ClusterError {
    match err {
        kube::Error::Api(response) if response.code == 404 => ClusterError::NotFound(what),
        other => ClusterError::Api(other),
    }
}

//! Test utilities for unit testing the dispatch engine.
//!
//! Provides an in-memory cluster fake that feeds shared informers the same
//! way the kube-backed implementation does, an HTTP echo server with a
//! scriptable status sequence, and builders for test objects.

#[cfg(test)]
use std::collections::VecDeque;
#[cfg(test)]
use std::net::SocketAddr;
#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};
#[cfg(test)]
use std::sync::{Arc, Mutex};
#[cfg(test)]
use std::time::{Duration, Instant};

#[cfg(test)]
use async_trait::async_trait;
#[cfg(test)]
use axum::extract::State;
#[cfg(test)]
use axum::http::StatusCode;
#[cfg(test)]
use axum::Router;
#[cfg(test)]
use chrono::Utc;
#[cfg(test)]
use dashmap::DashMap;
#[cfg(test)]
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
#[cfg(test)]
use kube::api::{DynamicObject, GroupVersionKind, ObjectMeta};

#[cfg(test)]
use crate::cluster::{gvk_key, Cluster, ClusterError, SharedInformer};
#[cfg(test)]
use crds::{Destination, HttpDestination, Watcher, WatcherSpec};

/// In-memory [`Cluster`]: objects live in a map, informers are the real
/// [`SharedInformer`] fed by writes, and the apiserver's finalizer dance is
/// emulated so lifecycle tests behave like the real thing.
#[cfg(test)]
pub struct FakeCluster {
    objects: DashMap<String, DynamicObject>,
    informers: DashMap<String, Arc<SharedInformer>>,
    removed_informers: Mutex<Vec<String>>,
    update_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

#[cfg(test)]
impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            objects: DashMap::new(),
            informers: DashMap::new(),
            removed_informers: Mutex::new(Vec::new()),
            update_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
        })
    }

    fn object_key(gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> String {
        match namespace {
            Some(namespace) => format!("{}|{namespace}/{name}", gvk_key(gvk)),
            None => format!("{}|{name}", gvk_key(gvk)),
        }
    }

    fn key_of(gvk: &GroupVersionKind, object: &DynamicObject) -> String {
        Self::object_key(
            gvk,
            object.metadata.namespace.as_deref(),
            object.metadata.name.as_deref().unwrap_or_default(),
        )
    }

    /// Creates or replaces an object and feeds the informer, if any.
    pub fn put(&self, gvk: &GroupVersionKind, object: DynamicObject) {
        self.objects.insert(Self::key_of(gvk, &object), object.clone());
        if let Some(informer) = self.informers.get(&gvk_key(gvk)) {
            informer.apply(object);
        }
    }

    /// Marks an object terminating, like a delete against an object holding a
    /// finalizer would.
    pub fn begin_deletion(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) {
        let key = Self::object_key(gvk, namespace, name);
        let Some(mut object) = self.objects.get(&key).map(|entry| entry.clone()) else {
            return;
        };
        object.metadata.deletion_timestamp = Some(Time(Utc::now()));
        bump_resource_version(&mut object);
        self.put(gvk, object);
    }

    /// Removes an object outright and fires the delete event.
    pub fn remove_object(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) {
        let key = Self::object_key(gvk, namespace, name);
        if let Some((_, object)) = self.objects.remove(&key) {
            if let Some(informer) = self.informers.get(&gvk_key(gvk)) {
                informer.delete(object);
            }
        }
    }

    pub fn get_object(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Option<DynamicObject> {
        self.objects
            .get(&Self::object_key(gvk, namespace, name))
            .map(|entry| entry.clone())
    }

    pub fn informer_count(&self) -> usize {
        self.informers.len()
    }

    pub fn removed_informers(&self) -> Vec<String> {
        self.removed_informers.lock().unwrap().clone()
    }

    pub fn update_call_count(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub fn delete_call_count(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl Cluster for FakeCluster {
    async fn informer(&self, gvk: &GroupVersionKind) -> Result<Arc<SharedInformer>, ClusterError> {
        let key = gvk_key(gvk);
        let informer = self
            .informers
            .entry(key.clone())
            .or_insert_with(|| {
                let informer = SharedInformer::new(gvk.clone());
                let prefix = format!("{key}|");
                for entry in self.objects.iter() {
                    if entry.key().starts_with(&prefix) {
                        informer.apply(entry.value().clone());
                    }
                }
                informer
            })
            .clone();
        Ok(informer)
    }

    async fn remove_informer(&self, gvk: &GroupVersionKind) -> Result<(), ClusterError> {
        let key = gvk_key(gvk);
        self.informers.remove(&key);
        self.removed_informers.lock().unwrap().push(key);
        Ok(())
    }

    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject, ClusterError> {
        self.cached_get(gvk, namespace, name)
    }

    fn cached_get(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject, ClusterError> {
        self.objects
            .get(&Self::object_key(gvk, namespace, name))
            .map(|entry| entry.clone())
            .ok_or_else(|| ClusterError::NotFound(Self::object_key(gvk, namespace, name)))
    }

    fn cached_list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>, ClusterError> {
        let prefix = format!("{}|", gvk_key(gvk));
        Ok(self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .map(|entry| entry.value().clone())
            .filter(|object| match namespace {
                Some(namespace) => object.metadata.namespace.as_deref() == Some(namespace),
                None => true,
            })
            .collect())
    }

    async fn update(
        &self,
        gvk: &GroupVersionKind,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let key = Self::key_of(gvk, object);
        if !self.objects.contains_key(&key) {
            return Err(ClusterError::NotFound(key));
        }

        let mut updated = object.clone();
        bump_resource_version(&mut updated);

        let finalizers_cleared = updated
            .metadata
            .finalizers
            .as_ref()
            .map_or(true, |finalizers| finalizers.is_empty());
        if updated.metadata.deletion_timestamp.is_some() && finalizers_cleared {
            // terminating object released its last finalizer: it vanishes
            self.objects.remove(&key);
            if let Some(informer) = self.informers.get(&gvk_key(gvk)) {
                informer.delete(updated.clone());
            }
            return Ok(updated);
        }

        self.objects.insert(key, updated.clone());
        if let Some(informer) = self.informers.get(&gvk_key(gvk)) {
            informer.apply(updated.clone());
        }
        Ok(updated)
    }

    async fn delete(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), ClusterError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let key = Self::object_key(gvk, namespace, name);
        let Some(current) = self.objects.get(&key).map(|entry| entry.clone()) else {
            return Err(ClusterError::NotFound(key));
        };

        let has_finalizers = current
            .metadata
            .finalizers
            .as_ref()
            .is_some_and(|finalizers| !finalizers.is_empty());
        if has_finalizers {
            if current.metadata.deletion_timestamp.is_none() {
                self.begin_deletion(gvk, namespace, name);
            }
            return Ok(());
        }

        self.objects.remove(&key);
        if let Some(informer) = self.informers.get(&gvk_key(gvk)) {
            informer.delete(current);
        }
        Ok(())
    }
}

#[cfg(test)]
fn bump_resource_version(object: &mut DynamicObject) {
    let next = object
        .metadata
        .resource_version
        .as_deref()
        .and_then(|version| version.parse::<u64>().ok())
        .unwrap_or(1)
        + 1;
    object.metadata.resource_version = Some(next.to_string());
}

#[cfg(test)]
#[derive(Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub body: String,
    pub headers: Vec<(String, String)>,
    pub at: Instant,
}

#[cfg(test)]
#[derive(Clone)]
struct ServerState {
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    responses: Arc<Mutex<VecDeque<u16>>>,
    delay: Duration,
}

/// Scriptable HTTP echo server recording every request it receives.
#[cfg(test)]
pub struct TestServer {
    pub addr: SocketAddr,
    state: ServerState,
}

#[cfg(test)]
impl TestServer {
    /// Starts a server answering the scripted status codes in order, then 200.
    pub async fn start(script: &[u16]) -> Self {
        Self::start_with_delay(script, Duration::ZERO).await
    }

    pub async fn start_with_delay(script: &[u16], delay: Duration) -> Self {
        let state = ServerState {
            requests: Arc::new(Mutex::new(Vec::new())),
            responses: Arc::new(Mutex::new(script.iter().copied().collect())),
            delay,
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().fallback(capture).with_state(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.state.requests.lock().unwrap().len()
    }

    /// Polls until `count` requests arrived or the timeout elapses.
    pub async fn wait_for_requests(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.request_count() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.request_count() >= count
    }
}

#[cfg(test)]
async fn capture(State(state): State<ServerState>, request: axum::extract::Request) -> StatusCode {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX).await.unwrap_or_default();
    state.requests.lock().unwrap().push(RecordedRequest {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        body: String::from_utf8_lossy(&body).to_string(),
        headers: parts
            .headers
            .iter()
            .map(|(key, value)| {
                (
                    key.to_string(),
                    String::from_utf8_lossy(value.as_bytes()).to_string(),
                )
            })
            .collect(),
        at: Instant::now(),
    });
    if !state.delay.is_zero() {
        tokio::time::sleep(state.delay).await;
    }
    let code = state.responses.lock().unwrap().pop_front().unwrap_or(200);
    StatusCode::from_u16(code).unwrap_or(StatusCode::OK)
}

/// Builds a minimal namespaced object of the given kind.
#[cfg(test)]
pub fn test_object(
    api_version: &str,
    kind: &str,
    namespace: &str,
    name: &str,
    uid: &str,
) -> DynamicObject {
    DynamicObject {
        types: Some(kube::api::TypeMeta {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
        }),
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(uid.to_string()),
            generation: Some(1),
            resource_version: Some("1".to_string()),
            ..Default::default()
        },
        data: serde_json::json!({}),
    }
}

#[cfg(test)]
pub fn secret_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("", "v1", "Secret")
}

#[cfg(test)]
pub fn test_watcher(uid: &str, spec: WatcherSpec) -> Watcher {
    let mut watcher = Watcher::new(&format!("watcher-{uid}"), spec);
    watcher.metadata.namespace = Some("default".to_string());
    watcher.metadata.uid = Some(uid.to_string());
    watcher
}

#[cfg(test)]
pub fn http_destination(url_template: &str, body_template: &str, header_template: &str) -> Destination {
    Destination {
        http: Some(HttpDestination {
            url_template: url_template.to_string(),
            body_template: body_template.to_string(),
            header_template: header_template.to_string(),
            method: None,
        }),
    }
}

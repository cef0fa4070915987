//! Shared informer: a per-kind object store with fan-out event handlers.
//!
//! Many watchers can attach handlers to the same informer; registration
//! replays the current store as add events, mirroring client-go semantics so
//! a watcher added after its source objects still sees them.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use kube::api::{DynamicObject, GroupVersionKind};

/// Callbacks fired on object changes. Handlers must not block: they only
/// enqueue work.
pub struct EventHandler {
    pub on_add: Box<dyn Fn(Arc<DynamicObject>) + Send + Sync>,
    pub on_update: Box<dyn Fn(Arc<DynamicObject>, Arc<DynamicObject>) + Send + Sync>,
    pub on_delete: Box<dyn Fn(Arc<DynamicObject>) + Send + Sync>,
}

/// Token returned on registration, used to detach the handler again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerRegistration(u64);

struct Inner {
    store: HashMap<String, Arc<DynamicObject>>,
    handlers: Vec<(u64, Arc<EventHandler>)>,
    /// Keys seen during an in-progress relist; objects missing from it are
    /// deleted when the relist completes.
    relist: Option<HashSet<String>>,
}

pub struct SharedInformer {
    gvk: GroupVersionKind,
    inner: Mutex<Inner>,
    next_handler: AtomicU64,
}

fn store_key(object: &DynamicObject) -> String {
    let name = object.metadata.name.as_deref().unwrap_or_default();
    match object.metadata.namespace.as_deref() {
        Some(namespace) => format!("{namespace}/{name}"),
        None => name.to_string(),
    }
}

impl SharedInformer {
    pub fn new(gvk: GroupVersionKind) -> Arc<Self> {
        Arc::new(Self {
            gvk,
            inner: Mutex::new(Inner {
                store: HashMap::new(),
                handlers: Vec::new(),
                relist: None,
            }),
            next_handler: AtomicU64::new(0),
        })
    }

    pub fn gvk(&self) -> &GroupVersionKind {
        &self.gvk
    }

    /// Attaches a handler and replays the current store as add events.
    pub fn add_event_handler(&self, handler: EventHandler) -> HandlerRegistration {
        let id = self.next_handler.fetch_add(1, Ordering::Relaxed);
        let handler = Arc::new(handler);
        let mut inner = self.inner.lock().unwrap();
        for object in inner.store.values() {
            (handler.on_add)(object.clone());
        }
        inner.handlers.push((id, handler));
        HandlerRegistration(id)
    }

    pub fn remove_event_handler(&self, registration: HandlerRegistration) {
        let mut inner = self.inner.lock().unwrap();
        inner.handlers.retain(|(id, _)| *id != registration.0);
    }

    /// Records an applied object and dispatches an add or update event.
    pub fn apply(&self, object: DynamicObject) {
        let key = store_key(&object);
        let object = Arc::new(object);
        let mut inner = self.inner.lock().unwrap();
        if let Some(relist) = &mut inner.relist {
            relist.insert(key.clone());
        }
        match inner.store.insert(key, object.clone()) {
            Some(old) => {
                for (_, handler) in &inner.handlers {
                    (handler.on_update)(old.clone(), object.clone());
                }
            }
            None => {
                for (_, handler) in &inner.handlers {
                    (handler.on_add)(object.clone());
                }
            }
        }
    }

    /// Removes an object and dispatches a delete event.
    pub fn delete(&self, object: DynamicObject) {
        let key = store_key(&object);
        let mut inner = self.inner.lock().unwrap();
        let object = inner.store.remove(&key).unwrap_or_else(|| Arc::new(object));
        for (_, handler) in &inner.handlers {
            (handler.on_delete)(object.clone());
        }
    }

    /// Starts a relist window; see [`SharedInformer::end_relist`].
    pub fn begin_relist(&self) {
        self.inner.lock().unwrap().relist = Some(HashSet::new());
    }

    /// Closes the relist window: objects in the store that the relist did not
    /// report are gone and dispatch delete events.
    pub fn end_relist(&self) {
        let mut inner = self.inner.lock().unwrap();
        let Some(seen) = inner.relist.take() else {
            return;
        };
        let stale: Vec<String> = inner
            .store
            .keys()
            .filter(|key| !seen.contains(*key))
            .cloned()
            .collect();
        for key in stale {
            if let Some(object) = inner.store.remove(&key) {
                for (_, handler) in &inner.handlers {
                    (handler.on_delete)(object.clone());
                }
            }
        }
    }

    pub fn get(&self, namespace: Option<&str>, name: &str) -> Option<Arc<DynamicObject>> {
        let key = match namespace {
            Some(namespace) => format!("{namespace}/{name}"),
            None => name.to_string(),
        };
        self.inner.lock().unwrap().store.get(&key).cloned()
    }

    pub fn list(&self, namespace: Option<&str>) -> Vec<Arc<DynamicObject>> {
        let inner = self.inner.lock().unwrap();
        inner
            .store
            .values()
            .filter(|object| match namespace {
                Some(namespace) => object.metadata.namespace.as_deref() == Some(namespace),
                None => true,
            })
            .cloned()
            .collect()
    }

    pub fn store_len(&self) -> usize {
        self.inner.lock().unwrap().store.len()
    }
}

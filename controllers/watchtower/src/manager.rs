//! Watcher lifecycle management.
//!
//! The manager keeps one runtime per live watcher: an informer registration,
//! a work queue and a worker pool. Informers are shared per source kind and
//! torn down when the last watcher targeting the kind is removed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kube::api::{DynamicObject, GroupVersionKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::cluster::{gvk_key, Cluster, EventHandler, HandlerRegistration, SharedInformer};
use crate::error::Error;
use crate::processor::{EventType, Processor, WorkItem};
use crate::queue::{QueueItem, WorkQueue};
use crate::template::TemplateEngine;
use crate::values;
use crds::{UpdateTrigger, Watcher};

struct WatcherEntry {
    gvk: GroupVersionKind,
    informer: Arc<SharedInformer>,
    registration: HandlerRegistration,
    queue: Arc<WorkQueue<WorkItem>>,
    stop: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Registry slot for one WatcherID. The slot is reserved synchronously on
/// `add` so a concurrent add or update for the same ID cannot stand up a
/// second runtime while `start` is still in flight; the token identifies the
/// reservation's owner.
enum WatcherState {
    Starting(u64),
    Running(Arc<WatcherEntry>),
}

pub struct WatcherManager {
    cluster: Arc<dyn Cluster>,
    templates: Arc<TemplateEngine>,
    watchers: DashMap<String, WatcherState>,
    start_token: AtomicU64,
}

impl WatcherManager {
    pub fn new(cluster: Arc<dyn Cluster>, templates: Arc<TemplateEngine>) -> Self {
        Self {
            cluster,
            templates,
            watchers: DashMap::new(),
            start_token: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.watchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }

    fn watcher_id(watcher: &Watcher) -> String {
        match &watcher.metadata.uid {
            Some(uid) => uid.clone(),
            None => display_name(watcher),
        }
    }

    /// Registers and starts a watcher. A no-op when the ID is already live or
    /// starting; configuration failures are logged and the watcher is not
    /// registered.
    pub async fn add(&self, watcher: &Watcher) {
        let id = Self::watcher_id(watcher);
        let token = self.start_token.fetch_add(1, Ordering::Relaxed);
        // reserve the slot before the first await so concurrent adds for the
        // same ID bail out instead of racing start()
        match self.watchers.entry(id.clone()) {
            Entry::Occupied(_) => return,
            Entry::Vacant(slot) => {
                slot.insert(WatcherState::Starting(token));
            }
        }

        let entry = match self.start(watcher).await {
            Ok(entry) => entry,
            Err(err) => {
                self.watchers
                    .remove_if(&id, |_, state| owns_reservation(state, token));
                error!(watcher = %display_name(watcher), error = %err, "Failed to add watcher");
                return;
            }
        };

        // publish only while the reservation is still ours; a remove that
        // raced in wins and the fresh runtime is torn down again
        let published = match self.watchers.entry(id) {
            Entry::Occupied(mut slot) if owns_reservation(slot.get(), token) => {
                slot.insert(WatcherState::Running(entry.clone()));
                true
            }
            _ => false,
        };
        if published {
            info!(watcher = %display_name(watcher), "Watcher added");
        } else {
            self.teardown(&entry).await;
            self.release_informer_if_unused(&entry.gvk).await;
            debug!(watcher = %display_name(watcher), "Watcher removed while starting");
        }
    }

    async fn start(&self, watcher: &Watcher) -> Result<Arc<WatcherEntry>, Error> {
        let effective = Arc::new(values::resolve(&self.cluster, watcher).await?);
        let processor = Arc::new(Processor::new(
            self.cluster.clone(),
            self.templates.clone(),
            effective.clone(),
        )?);

        let gvk = effective.spec.source.group_version_kind();
        let informer = self.cluster.informer(&gvk).await?;

        let queue = WorkQueue::new();
        let registration = informer.add_event_handler(source_event_handler(
            queue.clone(),
            effective.spec.source.update_on,
        ));

        let (stop, _) = watch::channel(false);
        let mut workers = Vec::with_capacity(effective.spec.source.concurrency());
        for _ in 0..effective.spec.source.concurrency() {
            let queue = queue.clone();
            let processor = processor.clone();
            let stop = stop.subscribe();
            workers.push(tokio::spawn(worker_loop(queue, processor, stop)));
        }

        Ok(Arc::new(WatcherEntry {
            gvk,
            informer,
            registration,
            queue,
            stop,
            workers: Mutex::new(workers),
        }))
    }

    /// Tears a watcher down, blocking until its in-flight workers exit. The
    /// source informer is dropped when no other watcher targets the kind.
    pub async fn remove(&self, watcher: &Watcher) {
        let id = Self::watcher_id(watcher);
        let entry = match self.watchers.get(&id).map(|slot| match slot.value() {
            WatcherState::Starting(_) => None,
            WatcherState::Running(entry) => Some(entry.clone()),
        }) {
            None => return,
            Some(None) => {
                // still starting: drop the reservation, the pending add will
                // discard its runtime instead of publishing it
                self.watchers
                    .remove_if(&id, |_, state| matches!(state, WatcherState::Starting(_)));
                return;
            }
            Some(Some(entry)) => entry,
        };

        self.teardown(&entry).await;
        // only clear the slot if it still holds the runtime we tore down
        self.watchers.remove_if(&id, |_, state| {
            matches!(state, WatcherState::Running(current) if Arc::ptr_eq(current, &entry))
        });
        self.release_informer_if_unused(&entry.gvk).await;

        info!(watcher = %display_name(watcher), "Watcher removed");
    }

    /// Replaces a watcher's runtime. Remove-then-add: the reverse order would
    /// leave two handlers racing on the same informer.
    pub async fn update(&self, watcher: &Watcher) {
        self.remove(watcher).await;
        self.add(watcher).await;
    }

    /// Stops workers and detaches the informer handler for a runtime.
    async fn teardown(&self, entry: &Arc<WatcherEntry>) {
        let _ = entry.stop.send(true);
        entry.queue.shut_down();
        let workers: Vec<JoinHandle<()>> = entry.workers.lock().unwrap().drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }
        entry.informer.remove_event_handler(entry.registration);
    }

    /// Drops the informer for a kind once no registered runtime targets it.
    async fn release_informer_if_unused(&self, gvk: &GroupVersionKind) {
        let source = gvk_key(gvk);
        let informer_in_use = self.watchers.iter().any(|other| match other.value() {
            WatcherState::Running(entry) => gvk_key(&entry.gvk) == source,
            WatcherState::Starting(_) => false,
        });
        if !informer_in_use {
            info!(source = %source, "Removing informer");
            if let Err(err) = self.cluster.remove_informer(gvk).await {
                error!(source = %source, error = %err, "Failed to remove informer");
            }
        }
    }
}

fn owns_reservation(state: &WatcherState, token: u64) -> bool {
    matches!(state, WatcherState::Starting(reserved) if *reserved == token)
}

fn display_name(watcher: &Watcher) -> String {
    format!(
        "{}/{}",
        watcher.metadata.namespace.as_deref().unwrap_or_default(),
        watcher.metadata.name.as_deref().unwrap_or_default()
    )
}

fn source_event_handler(queue: Arc<WorkQueue<WorkItem>>, update_on: UpdateTrigger) -> EventHandler {
    let add_queue = queue.clone();
    let update_queue = queue.clone();
    let delete_queue = queue;
    EventHandler {
        on_add: Box::new(move |object| {
            add_queue.add(WorkItem {
                event_type: EventType::Create,
                old_object: None,
                new_object: object,
            });
        }),
        on_update: Box::new(move |old, new| {
            if !update_relevant(update_on, &old, &new) {
                return;
            }
            update_queue.add(WorkItem {
                event_type: EventType::Update,
                old_object: Some(old),
                new_object: new,
            });
        }),
        on_delete: Box::new(move |object| {
            delete_queue.add(WorkItem {
                event_type: EventType::Delete,
                old_object: None,
                new_object: object,
            });
        }),
    }
}

/// Suppresses trivial churn. A flipped deletion timestamp always counts: the
/// termination marker never bumps the generation, and finalizer-guarded
/// objects would otherwise hang forever.
fn update_relevant(update_on: UpdateTrigger, old: &DynamicObject, new: &DynamicObject) -> bool {
    if old.metadata.deletion_timestamp != new.metadata.deletion_timestamp {
        return true;
    }
    match update_on {
        UpdateTrigger::Generation => old.metadata.generation != new.metadata.generation,
        UpdateTrigger::ResourceVersion => {
            old.metadata.resource_version != new.metadata.resource_version
        }
    }
}

async fn worker_loop(
    queue: Arc<WorkQueue<WorkItem>>,
    processor: Arc<Processor>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => return,
            item = queue.get() => {
                let Some(item) = item else { return };
                let key = item.key();
                match processor.process(&item).await {
                    Ok(()) => {
                        debug!(object = %key, event_type = %item.event_type, "Work item processed");
                    }
                    Err(err) => {
                        error!(object = %key, event_type = %item.event_type, error = %err,
                            "Error processing work item");
                        queue.add_rate_limited(item);
                    }
                }
                queue.done(&key);
            }
        }
    }
}

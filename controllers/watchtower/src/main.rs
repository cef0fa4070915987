//! Watchtower
//!
//! Generic cluster-resource-change notifier. Watcher resources bind a source
//! kind to a rendered outbound HTTP call; on create/update/delete of a
//! matching object the event is filtered, templated and dispatched.

mod cluster;
mod config;
mod elect;
mod error;
mod expr;
mod manager;
mod processor;
mod queue;
mod server;
mod template;
mod test_utils;
mod values;

#[cfg(test)]
mod manager_test;
#[cfg(test)]
mod values_test;

use std::sync::Arc;

use kube::api::{DynamicObject, GroupVersionKind};
use kube::{Client, Resource};
use tracing::{error, info};

use crate::cluster::{Cluster, EventHandler, KubeCluster};
use crate::config::Config;
use crate::elect::LeaderElector;
use crate::manager::WatcherManager;
use crate::template::TemplateEngine;
use crds::Watcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    info!("Starting Watchtower");

    let config = Config::from_env()?;
    let client = Client::try_default().await?;

    if config.leader_election {
        let elector = LeaderElector::new(
            client.clone(),
            config.namespace.as_deref().unwrap_or("default"),
        );
        elector.acquire().await?;
        tokio::spawn(async move {
            elector.hold().await;
            error!("Leader election lost, exiting");
            std::process::exit(1);
        });
    }

    let cluster: Arc<dyn Cluster> =
        KubeCluster::new(client, config.namespace.clone(), config.sync_period);
    let templates = Arc::new(TemplateEngine::new(cluster.clone()));
    let manager = Arc::new(WatcherManager::new(cluster.clone(), templates));

    {
        let addr = config.health_addr.clone();
        tokio::spawn(async move {
            if let Err(err) = server::serve_probes(addr).await {
                error!(error = %err, "Health server failed");
                std::process::exit(1);
            }
        });
    }
    {
        let addr = config.metrics_addr.clone();
        let manager = manager.clone();
        tokio::spawn(async move {
            if let Err(err) = server::serve_metrics(addr, manager).await {
                error!(error = %err, "Metrics server failed");
                std::process::exit(1);
            }
        });
    }

    let watcher_gvk = GroupVersionKind::gvk(
        &Watcher::group(&()),
        &Watcher::version(&()),
        &Watcher::kind(&()),
    );
    info!("Waiting for cache sync");
    let informer = cluster.informer(&watcher_gvk).await?;
    info!("Cache synced");

    let _registration = informer.add_event_handler(definition_handler(manager));
    info!("Watcher informer started");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}

/// Routes Watcher definition events into manager lifecycle calls. Handlers
/// only spawn: informer callbacks must not block.
fn definition_handler(manager: Arc<WatcherManager>) -> EventHandler {
    fn decode(object: &DynamicObject) -> Option<Watcher> {
        let raw = serde_json::to_value(object).ok()?;
        match serde_json::from_value(raw) {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                error!(error = %err, "Ignoring malformed watcher definition");
                None
            }
        }
    }

    let add_manager = manager.clone();
    let update_manager = manager.clone();
    let delete_manager = manager;
    EventHandler {
        on_add: Box::new(move |object| {
            let Some(watcher) = decode(&object) else { return };
            let manager = add_manager.clone();
            tokio::spawn(async move { manager.add(&watcher).await });
        }),
        on_update: Box::new(move |_old, new| {
            let Some(watcher) = decode(&new) else { return };
            let manager = update_manager.clone();
            tokio::spawn(async move { manager.update(&watcher).await });
        }),
        on_delete: Box::new(move |object| {
            let Some(watcher) = decode(&object) else { return };
            let manager = delete_manager.clone();
            tokio::spawn(async move { manager.remove(&watcher).await });
        }),
    }
}

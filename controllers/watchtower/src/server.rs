//! Health probes and metrics endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::Router;

use crate::manager::WatcherManager;

pub async fn serve_probes(addr: String) -> Result<(), std::io::Error> {
    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await
}

pub async fn serve_metrics(addr: String, manager: Arc<WatcherManager>) -> Result<(), std::io::Error> {
    let app = Router::new()
        .route("/metrics", get(metrics))
        .with_state(manager);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await
}

async fn metrics(State(manager): State<Arc<WatcherManager>>) -> String {
    format!(
        "# HELP watchtower_watchers Number of active watchers.\n\
         # TYPE watchtower_watchers gauge\n\
         watchtower_watchers {}\n",
        manager.len()
    )
}

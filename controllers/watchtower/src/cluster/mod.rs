//! Cluster cache contract.
//!
//! The dispatch engine talks to the cluster through this seam: informers for
//! change notification, store-backed reads for filters and templates, and an
//! API-backed client for the few writes the lifecycle hooks perform.

pub mod client;
pub mod informer;

pub use client::KubeCluster;
pub use informer::{EventHandler, HandlerRegistration, SharedInformer};

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{DynamicObject, GroupVersionKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    /// The object does not exist (live 404 or absent from the store)
    #[error("{0} not found")]
    NotFound(String),

    /// The informer backing a store read has not listed yet
    #[error("cache not ready for {0}")]
    CacheNotReady(String),

    /// API discovery could not resolve the kind
    #[error("discovery failed for {0}: {1}")]
    Discovery(String, String),

    /// The informer task stopped before its initial list completed
    #[error("informer for {0} failed to sync")]
    SyncFailed(String),

    /// Kubernetes API error
    #[error("kubernetes api error: {0}")]
    Api(#[from] kube::Error),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }
}

/// Stable map key for a kind.
pub fn gvk_key(gvk: &GroupVersionKind) -> String {
    format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
}

#[async_trait]
pub trait Cluster: Send + Sync + 'static {
    /// Returns the shared informer for a kind, starting it and waiting for
    /// its initial list on first use. One informer exists per kind.
    async fn informer(&self, gvk: &GroupVersionKind) -> Result<Arc<SharedInformer>, ClusterError>;

    /// Stops and drops the informer for a kind.
    async fn remove_informer(&self, gvk: &GroupVersionKind) -> Result<(), ClusterError>;

    /// Reads a single object, from the informer store when one is running,
    /// falling back to a live API read otherwise.
    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject, ClusterError>;

    /// Store-only read for synchronous callers (template helpers). A miss on
    /// a kind without an informer warms one up in the background and reports
    /// `CacheNotReady`.
    fn cached_get(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject, ClusterError>;

    /// Store-only list for synchronous callers.
    fn cached_list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>, ClusterError>;

    /// Replaces an object (finalizer add/remove).
    async fn update(
        &self,
        gvk: &GroupVersionKind,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError>;

    /// Deletes an object by name.
    async fn delete(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), ClusterError>;
}

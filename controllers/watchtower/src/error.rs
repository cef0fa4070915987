//! Controller-wide error types.
//!
//! Configuration problems are fatal to a watcher Add; everything else is a
//! runtime error that workers retry with backoff.

use thiserror::Error;

use crate::cluster::ClusterError;
use crate::expr::ExprError;

#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Cluster cache error
    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Invalid watcher configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unresolvable valuesFrom reference
    #[error("values reference error: {0}")]
    ValuesFrom(String),

    /// Template parse or render error
    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    /// Filter expression error
    #[error("expression error: {0}")]
    Expression(#[from] ExprError),

    /// HTTP transport error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Destination answered outside [200, 300)
    #[error("unexpected status code: {0}")]
    UnexpectedStatus(u16),

    /// YAML decode error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON encode/decode error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

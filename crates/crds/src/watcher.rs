//! Watcher CRD
//!
//! Binds a source resource kind to a rendered outbound HTTP notification.

use kube::api::GroupVersionKind;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Finalizer owned by the watchtower controller.
///
/// The string is stable across versions; objects carrying it are blocked from
/// deletion until the controller has dispatched their final notification.
pub const FINALIZER: &str = "watchtower.microscaler.io/finalizer";

/// Splits an `apiVersion` string into its group and version parts.
///
/// Core resources use the bare version form (`v1`), everything else is
/// `group/version` (`apps/v1`).
pub fn parse_group_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "watchtower.microscaler.io",
    version = "v1alpha1",
    kind = "Watcher",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct WatcherSpec {
    /// Source defines the objects of the watching process
    #[serde(default)]
    pub source: Source,

    /// Filter expressions evaluated per event before dispatch
    #[serde(default)]
    pub filter: Filter,

    /// Destination sets where rendered notifications will be sent
    #[serde(default)]
    pub destination: Destination,

    /// References (Secret/ConfigMap) merged into this spec at registration
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values_from: Vec<ValuesFrom>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    /// API version of the object like apps/v1, v1 etc.
    #[serde(default)]
    pub api_version: String,

    /// Kind of the object like Deployment, Secret, MyCustomResource etc.
    #[serde(default)]
    pub kind: String,

    /// How many concurrent workers will be processing this source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,

    /// Lifecycle policies applied around dispatch
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<LifecyclePolicy>,

    /// Which object change marks an update as worth dispatching
    #[serde(default)]
    pub update_on: UpdateTrigger,
}

impl Source {
    pub fn group_version_kind(&self) -> GroupVersionKind {
        let (group, version) = parse_group_version(&self.api_version);
        GroupVersionKind::gvk(group, version, &self.kind)
    }

    pub fn concurrency(&self) -> usize {
        match self.concurrency {
            Some(concurrency) => concurrency.max(1) as usize,
            None => 1,
        }
    }

    pub fn has_policy(&self, policy: LifecyclePolicy) -> bool {
        self.policies.contains(&policy)
    }
}

/// Lifecycle behavior applied to source objects around dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum LifecyclePolicy {
    /// Guard source objects with the watchtower finalizer until their final
    /// notification has been delivered.
    UseFinalizer,
    /// Delete the source object once it has been successfully processed.
    DeleteOnSuccess,
}

/// Change detection strategy for update events.
///
/// `Generation` suppresses status-only churn; `ResourceVersion` dispatches on
/// every write to the object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum UpdateTrigger {
    #[default]
    Generation,
    ResourceVersion,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    /// Expression evaluated for create events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<String>,

    /// Expression evaluated for update events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<String>,

    /// Expression evaluated for delete events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Destination {
    /// HTTP destination; the only supported sink today
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpDestination>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HttpDestination {
    /// Template rendering the destination URL
    #[serde(default)]
    pub url_template: String,

    /// Template rendering the request body
    #[serde(default)]
    pub body_template: String,

    /// Template rendering newline separated `Key: Value` header lines
    #[serde(default)]
    pub header_template: String,

    /// Explicit HTTP method; derived from the event type when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

/// Reference to a Secret or ConfigMap to retrieve spec values from.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValuesFrom {
    /// Whether the source is a Secret or ConfigMap
    pub kind: ValuesFromKind,

    /// Name of the Secret or ConfigMap
    pub name: String,

    /// Key within the Secret or ConfigMap holding the value
    pub key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ValuesFromKind {
    Secret,
    ConfigMap,
}

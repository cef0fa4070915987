//! `valuesFrom` resolution.
//!
//! References are fetched from the cluster at registration time, decoded as
//! Watcher-shaped YAML documents and deep-merged into a local copy of the
//! spec, later sources winning. The external object is never rewritten.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use kube::api::GroupVersionKind;
use serde_json::Value;

use crate::cluster::Cluster;
use crate::error::Error;
use crds::{ValuesFrom, ValuesFromKind, Watcher};

/// Returns a copy of the watcher with every `valuesFrom` reference merged in.
pub async fn resolve(cluster: &Arc<dyn Cluster>, watcher: &Watcher) -> Result<Watcher, Error> {
    if watcher.spec.values_from.is_empty() {
        return Ok(watcher.clone());
    }

    let namespace = watcher.metadata.namespace.clone();
    let mut effective = serde_json::to_value(watcher)?;
    for reference in &watcher.spec.values_from {
        let document = fetch(cluster, namespace.as_deref(), reference).await?;
        let fragment: Value = serde_yaml::from_str(&document)?;
        merge(&mut effective, &fragment);
    }
    Ok(serde_json::from_value(effective)?)
}

async fn fetch(
    cluster: &Arc<dyn Cluster>,
    namespace: Option<&str>,
    reference: &ValuesFrom,
) -> Result<String, Error> {
    let (kind, gvk) = match reference.kind {
        ValuesFromKind::Secret => ("secret", GroupVersionKind::gvk("", "v1", "Secret")),
        ValuesFromKind::ConfigMap => ("configmap", GroupVersionKind::gvk("", "v1", "ConfigMap")),
    };

    let object = cluster
        .get(&gvk, namespace, &reference.name)
        .await
        .map_err(|err| Error::ValuesFrom(format!("{kind} {}: {err}", reference.name)))?;

    let value = object
        .data
        .get("data")
        .and_then(|data| data.get(reference.key.as_str()))
        .and_then(Value::as_str)
        .ok_or_else(|| {
            Error::ValuesFrom(format!(
                "key {} in {kind} {} not found",
                reference.key, reference.name
            ))
        })?;

    match reference.kind {
        ValuesFromKind::Secret => {
            let bytes = BASE64.decode(value.as_bytes()).map_err(|err| {
                Error::ValuesFrom(format!(
                    "key {} in secret {} is not base64: {err}",
                    reference.key, reference.name
                ))
            })?;
            String::from_utf8(bytes).map_err(|err| {
                Error::ValuesFrom(format!(
                    "key {} in secret {} is not utf-8: {err}",
                    reference.key, reference.name
                ))
            })
        }
        ValuesFromKind::ConfigMap => Ok(value.to_string()),
    }
}

/// Override merge: maps merge key-wise, `null` never overrides, scalars and
/// arrays replace.
pub(crate) fn merge(target: &mut Value, overlay: &Value) {
    match (target, overlay) {
        (Value::Object(target), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match target.get_mut(key) {
                    Some(existing) => merge(existing, value),
                    None if !value.is_null() => {
                        target.insert(key.clone(), value.clone());
                    }
                    None => {}
                }
            }
        }
        (_, Value::Null) => {}
        (target, overlay) => *target = overlay.clone(),
    }
}

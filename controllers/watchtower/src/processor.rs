//! Per-watcher event processing.
//!
//! A processor takes one work item through re-fetch, filter, pre-flight,
//! dispatch and post-flight. Any error bubbles back to the worker, which
//! re-enqueues the item with backoff.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use kube::api::{DynamicObject, GroupVersionKind};
use reqwest::Method;
use serde_json::Value;
use tracing::debug;

use crate::cluster::Cluster;
use crate::error::Error;
use crate::expr;
use crate::queue::QueueItem;
use crate::template::TemplateEngine;
use crds::{HttpDestination, LifecyclePolicy, Watcher, FINALIZER};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Create,
    Update,
    Delete,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Create => "create",
            EventType::Update => "update",
            EventType::Delete => "delete",
        }
    }

    fn default_method(&self) -> Method {
        match self {
            EventType::Create => Method::POST,
            EventType::Update => Method::PUT,
            EventType::Delete => Method::DELETE,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct WorkItem {
    pub event_type: EventType,
    pub old_object: Option<Arc<DynamicObject>>,
    pub new_object: Arc<DynamicObject>,
}

impl QueueItem for WorkItem {
    fn key(&self) -> String {
        object_id(&self.new_object)
    }
}

/// Deduplication identity of an object: its UID, with a namespace/name
/// fallback for objects that never carried one.
pub fn object_id(object: &DynamicObject) -> String {
    match &object.metadata.uid {
        Some(uid) => uid.clone(),
        None => format!(
            "{}/{}",
            object.metadata.namespace.as_deref().unwrap_or_default(),
            object.metadata.name.as_deref().unwrap_or_default()
        ),
    }
}

/// Destination variants; only HTTP exists today.
enum Sink {
    Http(HttpDestination),
}

pub struct Processor {
    cluster: Arc<dyn Cluster>,
    templates: Arc<TemplateEngine>,
    watcher: Arc<Watcher>,
    gvk: GroupVersionKind,
    http: reqwest::Client,
    sink: Sink,
}

impl Processor {
    pub fn new(
        cluster: Arc<dyn Cluster>,
        templates: Arc<TemplateEngine>,
        watcher: Arc<Watcher>,
    ) -> Result<Self, Error> {
        let source = &watcher.spec.source;
        if source.api_version.is_empty() || source.kind.is_empty() {
            return Err(Error::InvalidConfig(
                "source apiVersion and kind are required".to_string(),
            ));
        }
        let destination = watcher
            .spec
            .destination
            .http
            .clone()
            .ok_or_else(|| Error::InvalidConfig("destination.http is not configured".to_string()))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            cluster,
            templates,
            gvk: watcher.spec.source.group_version_kind(),
            watcher,
            http,
            sink: Sink::Http(destination),
        })
    }

    pub async fn process(&self, item: &WorkItem) -> Result<(), Error> {
        let latest = match item.event_type {
            // a deleted object cannot be re-fetched; the event carries its
            // final state
            EventType::Delete => (*item.new_object).clone(),
            _ => match self.refetch(&item.new_object).await? {
                Some(latest) => latest,
                None => return Ok(()), // object gone
            },
        };

        let data = self.event_data(item, &latest)?;
        if !self.filter(item.event_type, &data)? {
            debug!(object = %object_id(&latest), "Filtered out");
            return Ok(());
        }

        let latest = self.pre_flight(&latest).await?;
        self.flight(item.event_type, &data).await?;
        self.post_flight(&latest).await?;
        Ok(())
    }

    /// Re-reads the object from the cache to close the stale window between
    /// the event and processing. `None` means the object disappeared.
    async fn refetch(&self, object: &DynamicObject) -> Result<Option<DynamicObject>, Error> {
        let name = object.metadata.name.as_deref().unwrap_or_default();
        let namespace = object.metadata.namespace.as_deref();
        match self.cluster.get(&self.gvk, namespace, name).await {
            Ok(latest) => Ok(Some(latest)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn event_data(&self, item: &WorkItem, latest: &DynamicObject) -> Result<Value, Error> {
        let object = serde_json::to_value(latest)?;
        let mut data = serde_json::Map::new();
        data.insert(
            "eventType".to_string(),
            Value::String(item.event_type.as_str().to_string()),
        );
        data.insert("object".to_string(), object.clone());
        data.insert("new".to_string(), object.clone());
        data.insert(
            "now".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        if item.event_type == EventType::Update {
            if let Some(old) = &item.old_object {
                let old = serde_json::to_value(&**old)?;
                data.insert("oldObject".to_string(), old.clone());
                data.insert("old".to_string(), old);
            }
            data.insert("newObject".to_string(), object);
        }
        Ok(Value::Object(data))
    }

    fn filter(&self, event_type: EventType, data: &Value) -> Result<bool, Error> {
        let filter = &self.watcher.spec.filter;
        let expression = match event_type {
            EventType::Create => &filter.create,
            EventType::Update => &filter.update,
            EventType::Delete => &filter.delete,
        };
        let Some(expression) = expression else {
            return Ok(true);
        };
        let bindings: Vec<(&str, &Value)> = data
            .as_object()
            .map(|map| map.iter().map(|(key, value)| (key.as_str(), value)).collect())
            .unwrap_or_default();
        Ok(expr::evaluate_bool(expression, &bindings)?)
    }

    /// Ensures the finalizer is present on live objects when the watcher asks
    /// for it. Idempotent: an object already carrying it is left alone.
    async fn pre_flight(&self, latest: &DynamicObject) -> Result<DynamicObject, Error> {
        if !self.watcher.spec.source.has_policy(LifecyclePolicy::UseFinalizer) {
            return Ok(latest.clone());
        }
        let finalizers = latest.metadata.finalizers.clone().unwrap_or_default();
        if latest.metadata.deletion_timestamp.is_some()
            || finalizers.iter().any(|finalizer| finalizer == FINALIZER)
        {
            return Ok(latest.clone());
        }

        let mut updated = latest.clone();
        let mut finalizers = finalizers;
        finalizers.push(FINALIZER.to_string());
        updated.metadata.finalizers = Some(finalizers);
        Ok(self.cluster.update(&self.gvk, &updated).await?)
    }

    /// Renders and sends the notification.
    async fn flight(&self, event_type: EventType, data: &Value) -> Result<(), Error> {
        let Sink::Http(destination) = &self.sink;

        let url = self.templates.render(&destination.url_template, data)?;
        let body = self.templates.render(&destination.body_template, data)?;
        let header_block = self.templates.render(&destination.header_template, data)?;

        let method = match destination.method.as_deref() {
            Some(method) if !method.is_empty() => {
                Method::from_bytes(method.to_uppercase().as_bytes())
                    .map_err(|_| Error::InvalidConfig(format!("invalid http method {method:?}")))?
            }
            _ => event_type.default_method(),
        };

        let mut request = self.http.request(method, url.as_str()).body(body);
        for (key, values) in parse_header_block(&header_block) {
            for value in values {
                request = request.header(key.as_str(), value);
            }
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(Error::UnexpectedStatus(status));
        }
        Ok(())
    }

    /// Releases terminating objects and applies delete-on-success.
    async fn post_flight(&self, latest: &DynamicObject) -> Result<(), Error> {
        if latest.metadata.deletion_timestamp.is_some() {
            let has_finalizer = latest
                .metadata
                .finalizers
                .as_ref()
                .is_some_and(|finalizers| finalizers.iter().any(|finalizer| finalizer == FINALIZER));
            if has_finalizer {
                let mut updated = latest.clone();
                updated.metadata.finalizers = latest.metadata.finalizers.as_ref().map(|finalizers| {
                    finalizers
                        .iter()
                        .filter(|finalizer| finalizer.as_str() != FINALIZER)
                        .cloned()
                        .collect()
                });
                match self.cluster.update(&self.gvk, &updated).await {
                    Ok(_) => {}
                    Err(err) if err.is_not_found() => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }

        if self.watcher.spec.source.has_policy(LifecyclePolicy::DeleteOnSuccess) {
            let name = latest.metadata.name.as_deref().unwrap_or_default();
            let namespace = latest.metadata.namespace.as_deref();
            match self.cluster.delete(&self.gvk, namespace, name).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

/// Parses a rendered header block: newline-delimited `Key: Value` lines,
/// surrounding quotes stripped, repeated keys accumulating values. Lines
/// without a colon are ignored.
pub(crate) fn parse_header_block(rendered: &str) -> Vec<(String, Vec<String>)> {
    let mut headers: Vec<(String, Vec<String>)> = Vec::new();
    for line in rendered.lines() {
        let Some((key, value)) = line.trim().split_once(':') else {
            continue;
        };
        let key = key.trim().trim_matches('"').trim();
        let value = value.trim().trim_matches('"').trim();
        if key.is_empty() {
            continue;
        }
        match headers.iter_mut().find(|(existing, _)| existing == key) {
            Some((_, values)) => values.push(value.to_string()),
            None => headers.push((key.to_string(), vec![value.to_string()])),
        }
    }
    headers
}

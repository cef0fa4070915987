//! Template rendering for destination URLs, bodies and headers.
//!
//! One minijinja environment is built at manager start and shared read-only
//! by every processor. Beyond the engine's builtin filters the registry adds
//! encoding, digest, regex and YAML/JSON helpers plus the cluster-aware
//! lookups and S3 presigning the original notification templates rely on.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{SecondsFormat, Utc};
use md5::Md5;
use minijinja::value::Rest;
use minijinja::{Environment, Error as TemplateError, ErrorKind, Value};
use rusty_s3::{Bucket, Credentials, S3Action, UrlStyle};
use sha2::{Digest, Sha256};
use url::Url;

use crate::cluster::Cluster;
use crds::parse_group_version;
use kube::api::GroupVersionKind;

pub struct TemplateEngine {
    env: Environment<'static>,
}

impl TemplateEngine {
    pub fn new(cluster: Arc<dyn Cluster>) -> Self {
        let mut env = Environment::new();
        env.add_filter("b64encode", b64encode);
        env.add_filter("b64decode", b64decode);
        env.add_filter("sha256", sha256_hex);
        env.add_filter("md5", md5_hex);
        env.add_filter("regex_match", regex_match);
        env.add_filter("regex_replace", regex_replace);
        env.add_filter("from_json", from_json);
        env.add_filter("to_yaml", to_yaml);
        env.add_filter("from_yaml", from_yaml);
        env.add_function("now", now);
        env.add_function("presigned_url", presigned_url);
        {
            let cluster = cluster.clone();
            env.add_function(
                "cluster_get",
                move |api_version_kind: String, name_namespace: String| {
                    cluster_get(&cluster, &api_version_kind, &name_namespace)
                },
            );
        }
        env.add_function(
            "cluster_list",
            move |api_version_kind: String, namespace: String| {
                cluster_list(&cluster, &api_version_kind, &namespace)
            },
        );
        Self { env }
    }

    /// Parses and renders in one step; templates are re-parsed per flight so
    /// a broken template is a retryable runtime error, not a poison pill.
    pub fn render(&self, source: &str, data: &serde_json::Value) -> Result<String, TemplateError> {
        self.env.render_str(source, data)
    }
}

fn invalid(message: String) -> TemplateError {
    TemplateError::new(ErrorKind::InvalidOperation, message)
}

fn b64encode(value: String) -> String {
    BASE64.encode(value.as_bytes())
}

fn b64decode(value: String) -> Result<String, TemplateError> {
    let bytes = BASE64
        .decode(value.as_bytes())
        .map_err(|err| invalid(format!("invalid base64: {err}")))?;
    String::from_utf8(bytes).map_err(|err| invalid(format!("decoded base64 is not utf-8: {err}")))
}

fn sha256_hex(value: String) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

fn md5_hex(value: String) -> String {
    hex::encode(Md5::digest(value.as_bytes()))
}

fn regex_match(value: String, pattern: String) -> Result<bool, TemplateError> {
    let pattern = regex::Regex::new(&pattern)
        .map_err(|err| invalid(format!("invalid pattern: {err}")))?;
    Ok(pattern.is_match(&value))
}

fn regex_replace(
    value: String,
    pattern: String,
    replacement: String,
) -> Result<String, TemplateError> {
    let pattern = regex::Regex::new(&pattern)
        .map_err(|err| invalid(format!("invalid pattern: {err}")))?;
    Ok(pattern.replace_all(&value, replacement.as_str()).into_owned())
}

fn from_json(value: String) -> Result<Value, TemplateError> {
    let parsed: serde_json::Value =
        serde_json::from_str(&value).map_err(|err| invalid(format!("invalid json: {err}")))?;
    Ok(Value::from_serialize(&parsed))
}

fn to_yaml(value: Value) -> Result<String, TemplateError> {
    serde_yaml::to_string(&value).map_err(|err| invalid(format!("yaml encode failed: {err}")))
}

fn from_yaml(value: String) -> Result<Value, TemplateError> {
    let parsed: serde_json::Value =
        serde_yaml::from_str(&value).map_err(|err| invalid(format!("invalid yaml: {err}")))?;
    Ok(Value::from_serialize(&parsed))
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Splits the `apiVersion;kind` convention used by the cluster helpers.
fn parse_api_version_kind(input: &str) -> Result<GroupVersionKind, TemplateError> {
    let Some((api_version, kind)) = input.split_once(';') else {
        return Err(invalid(format!(
            "expected 'apiVersion;kind', got {input:?}"
        )));
    };
    let (group, version) = parse_group_version(api_version);
    Ok(GroupVersionKind::gvk(group, version, kind))
}

fn cluster_get(
    cluster: &Arc<dyn Cluster>,
    api_version_kind: &str,
    name_namespace: &str,
) -> Result<Value, TemplateError> {
    let gvk = parse_api_version_kind(api_version_kind)?;
    let (name, namespace) = match name_namespace.split_once('/') {
        Some((name, namespace)) => (name, Some(namespace)),
        None => (name_namespace, None),
    };
    let object = cluster
        .cached_get(&gvk, namespace.filter(|ns| !ns.is_empty()), name)
        .map_err(|err| invalid(err.to_string()))?;
    Ok(Value::from_serialize(&object))
}

fn cluster_list(
    cluster: &Arc<dyn Cluster>,
    api_version_kind: &str,
    namespace: &str,
) -> Result<Value, TemplateError> {
    let gvk = parse_api_version_kind(api_version_kind)?;
    let namespace = (!namespace.is_empty()).then_some(namespace);
    let objects = cluster
        .cached_list(&gvk, namespace)
        .map_err(|err| invalid(err.to_string()))?;
    Ok(Value::from_serialize(&objects))
}

/// `presigned_url(endpoint, "access:secret", bucket, path, expiry)`
fn presigned_url(args: Rest<String>) -> Result<String, TemplateError> {
    let [endpoint, credentials, bucket, path, expiry] = args.0.as_slice() else {
        return Err(invalid(format!(
            "presigned_url takes 5 arguments, got {}",
            args.0.len()
        )));
    };

    let parts: Vec<&str> = credentials.split(':').collect();
    if parts.len() != 2 {
        return Err(invalid("credentials must be 'access:secret'".to_string()));
    }

    let secure = endpoint.starts_with("https://");
    let host = endpoint
        .trim_start_matches("http://")
        .trim_start_matches("https://");
    let scheme = if secure { "https" } else { "http" };
    let endpoint: Url = format!("{scheme}://{host}")
        .parse()
        .map_err(|err| invalid(format!("invalid endpoint: {err}")))?;

    let expiry = humantime::parse_duration(expiry)
        .map_err(|err| invalid(format!("invalid expiry: {err}")))?;
    let bucket = Bucket::new(endpoint, UrlStyle::Path, bucket.clone(), "us-east-1")
        .map_err(|err| invalid(format!("invalid bucket: {err}")))?;
    let credentials = Credentials::new(parts[0], parts[1]);
    let action = bucket.get_object(Some(&credentials), path);
    Ok(action.sign(expiry).to_string())
}

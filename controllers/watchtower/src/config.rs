//! Environment-driven configuration.

use std::env;
use std::time::Duration;

use crate::error::Error;

const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:8083";
const DEFAULT_HEALTH_ADDR: &str = "0.0.0.0:8084";
// client-go's default informer resync
const DEFAULT_SYNC_PERIOD: Duration = Duration::from_secs(10 * 60 * 60);

#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address of the metrics endpoint.
    pub metrics_addr: String,
    /// Bind address of the health probes.
    pub health_addr: String,
    /// Run behind a coordination lease so multiple replicas can wait to start.
    pub leader_election: bool,
    /// Minimum frequency at which watched resources are relisted.
    pub sync_period: Duration,
    /// Restrict watches to a single namespace; all namespaces when unset.
    pub namespace: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, Error> {
        let sync_period = match env::var("WATCHTOWER_SYNC_PERIOD") {
            Ok(value) => humantime::parse_duration(&value)
                .map_err(|err| Error::InvalidConfig(format!("WATCHTOWER_SYNC_PERIOD: {err}")))?,
            Err(_) => DEFAULT_SYNC_PERIOD,
        };

        Ok(Self {
            metrics_addr: env::var("WATCHTOWER_METRICS_ADDR")
                .unwrap_or_else(|_| DEFAULT_METRICS_ADDR.to_string()),
            health_addr: env::var("WATCHTOWER_HEALTH_ADDR")
                .unwrap_or_else(|_| DEFAULT_HEALTH_ADDR.to_string()),
            leader_election: env::var("WATCHTOWER_LEADER_ELECTION")
                .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            sync_period,
            namespace: env::var("WATCHTOWER_NAMESPACE")
                .ok()
                .filter(|value| !value.is_empty()),
        })
    }
}

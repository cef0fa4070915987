//! Lease-based leader election.
//!
//! A minimal coordination/v1 elector: blocks at boot until the lease is won,
//! then renews it in the background. Losing the lease is fatal to the process
//! so a standby replica can take over.

use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use tracing::{info, warn};

use crate::error::Error;

const LEASE_NAME: &str = "watchtower.microscaler.io";
const LEASE_DURATION: Duration = Duration::from_secs(15);
const RETRY_PERIOD: Duration = Duration::from_secs(2);

pub struct LeaderElector {
    api: Api<Lease>,
    identity: String,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str) -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "watchtower".to_string());
        Self {
            api: Api::namespaced(client, namespace),
            identity: format!("{host}-{}", uuid::Uuid::new_v4()),
        }
    }

    /// Blocks until leadership is acquired.
    pub async fn acquire(&self) -> Result<(), Error> {
        info!(identity = %self.identity, "Waiting for leader election");
        loop {
            if self.try_acquire().await? {
                info!(identity = %self.identity, "Leader election won");
                return Ok(());
            }
            tokio::time::sleep(RETRY_PERIOD).await;
        }
    }

    /// Renews the lease until renewal fails or the lease is taken over;
    /// returning means leadership is lost.
    pub async fn hold(&self) {
        let renew_period = LEASE_DURATION / 3;
        loop {
            tokio::time::sleep(renew_period).await;
            match self.try_acquire().await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(identity = %self.identity, "Lease taken over by another holder");
                    return;
                }
                Err(err) => {
                    warn!(identity = %self.identity, error = %err, "Lease renewal failed");
                    return;
                }
            }
        }
    }

    async fn try_acquire(&self) -> Result<bool, Error> {
        match self.api.get_opt(LEASE_NAME).await? {
            None => {
                let lease = self.desired_lease(None);
                match self.api.create(&PostParams::default(), &lease).await {
                    Ok(_) => Ok(true),
                    Err(kube::Error::Api(response)) if response.code == 409 => Ok(false),
                    Err(err) => Err(err.into()),
                }
            }
            Some(current) => {
                let spec = current.spec.clone().unwrap_or_default();
                let holder = spec.holder_identity.as_deref();
                let expired = spec
                    .renew_time
                    .as_ref()
                    .map(|renewed| {
                        let deadline = renewed.0
                            + chrono::Duration::seconds(
                                spec.lease_duration_seconds.unwrap_or(15) as i64
                            );
                        deadline < Utc::now()
                    })
                    .unwrap_or(true);

                if holder != Some(self.identity.as_str()) && !expired {
                    return Ok(false);
                }

                let mut lease = self.desired_lease(spec.lease_transitions);
                lease.metadata.resource_version = current.metadata.resource_version.clone();
                if holder != Some(self.identity.as_str()) {
                    if let Some(spec) = lease.spec.as_mut() {
                        spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
                    }
                }
                match self
                    .api
                    .replace(LEASE_NAME, &PostParams::default(), &lease)
                    .await
                {
                    Ok(_) => Ok(true),
                    Err(kube::Error::Api(response)) if response.code == 409 => Ok(false),
                    Err(err) => Err(err.into()),
                }
            }
        }
    }

    fn desired_lease(&self, transitions: Option<i32>) -> Lease {
        let now = MicroTime(Utc::now());
        Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
                acquire_time: Some(now.clone()),
                renew_time: Some(now),
                lease_transitions: transitions,
                ..Default::default()
            }),
        }
    }
}

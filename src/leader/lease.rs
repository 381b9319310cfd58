use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use std::time::Duration;
use tracing::{debug, info};

use super::{LeaseLock, LeaseObservation};
use crate::Result;

/// A `coordination.k8s.io/v1` Lease used as the cluster-wide lock.
///
/// Updates carry the resource version that was read, so two replicas racing
/// for the same Lease cannot both win; the loser sees a conflict and reports
/// the lease as not acquired.
pub struct KubeLeaseLock {
    api: Api<Lease>,
    name: String,
}

impl KubeLeaseLock {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
        }
    }
}

fn is_conflict(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(resp) if resp.code == 409)
}

fn expired(spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
    match (&spec.renew_time, spec.lease_duration_seconds) {
        (Some(MicroTime(renewed)), Some(secs)) => {
            *renewed + chrono::Duration::seconds(secs.into()) < now
        }
        _ => true,
    }
}

#[async_trait]
impl LeaseLock for KubeLeaseLock {
    async fn try_acquire_or_renew(
        &self,
        identity: &str,
        lease_duration: Duration,
    ) -> Result<LeaseObservation> {
        let now = Utc::now();
        let duration_secs = i32::try_from(lease_duration.as_secs().max(1)).unwrap_or(i32::MAX);

        let Some(mut lease) = self.api.get_opt(&self.name).await? else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(self.name.clone()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(identity.to_string()),
                    lease_duration_seconds: Some(duration_secs),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_transitions: Some(0),
                    ..Default::default()
                }),
            };
            return match self.api.create(&PostParams::default(), &lease).await {
                Ok(_) => {
                    info!(lease = %self.name, identity = %identity, "Created lease");
                    Ok(LeaseObservation::acquired(identity))
                }
                Err(e) if is_conflict(&e) => Ok(LeaseObservation {
                    holder: None,
                    acquired: false,
                }),
                Err(e) => Err(e.into()),
            };
        };

        let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
        let holder = spec.holder_identity.clone().filter(|h| !h.is_empty());
        let held_by_us = holder.as_deref() == Some(identity);

        if !held_by_us && holder.is_some() && !expired(spec, now) {
            return Ok(LeaseObservation {
                holder,
                acquired: false,
            });
        }

        if !held_by_us {
            debug!(lease = %self.name, previous = ?holder, "Taking over lease");
            spec.holder_identity = Some(identity.to_string());
            spec.acquire_time = Some(MicroTime(now));
            spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
        }
        spec.renew_time = Some(MicroTime(now));
        spec.lease_duration_seconds = Some(duration_secs);

        match self.api.replace(&self.name, &PostParams::default(), &lease).await {
            Ok(_) => Ok(LeaseObservation::acquired(identity)),
            Err(e) if is_conflict(&e) => Ok(LeaseObservation {
                holder,
                acquired: false,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn release(&self, identity: &str) -> Result<()> {
        let Some(mut lease) = self.api.get_opt(&self.name).await? else {
            return Ok(());
        };
        let Some(spec) = lease.spec.as_mut() else {
            return Ok(());
        };
        if spec.holder_identity.as_deref() != Some(identity) {
            return Ok(());
        }

        spec.holder_identity = None;
        spec.lease_duration_seconds = Some(1);
        spec.renew_time = Some(MicroTime(Utc::now()));

        match self.api.replace(&self.name, &PostParams::default(), &lease).await {
            Ok(_) => {
                info!(lease = %self.name, identity = %identity, "Released lease");
                Ok(())
            }
            Err(e) if is_conflict(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

//! Lease-based leader election.
//!
//! With several operator replicas, only the holder of the
//! `coordination.k8s.io/v1` Lease runs the controllers. Standby replicas
//! block in [`LeaderElector::acquire`] until the lease expires or is
//! released. Losing the lease cancels the shared shutdown token, so the
//! controllers stop before another replica takes over.

use crate::error::{OperatorError, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const LEASE_NAME: &str = "svcat-apiserver-operator-lock";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

const SERVICE_ACCOUNT_NAMESPACE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Namespace holding the lease: explicit value, then the pod's service
/// account namespace, then `default`.
pub fn detect_namespace(explicit: &str) -> String {
    if !explicit.is_empty() {
        return explicit.to_string();
    }
    std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE)
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "default".to_string())
}

/// Identity written into the lease: pod name, host name, or a random id.
pub fn detect_identity() -> String {
    std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("svcat-apiserver-operator-{:08x}", rand::random::<u32>()))
}

fn holder(lease: &Lease) -> Option<&str> {
    lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref())
}

/// A lease without a holder or without a renewal inside its duration is free.
fn lease_expired(spec: Option<&LeaseSpec>, now: DateTime<Utc>) -> bool {
    let Some(spec) = spec else {
        return true;
    };
    if spec.holder_identity.as_deref().unwrap_or_default().is_empty() {
        return true;
    }
    let duration = i64::from(spec.lease_duration_seconds.unwrap_or(LEASE_DURATION_SECS));
    match &spec.renew_time {
        Some(MicroTime(renewed)) => now.signed_duration_since(*renewed).num_seconds() > duration,
        None => true,
    }
}

pub struct LeaderElector {
    leases: Api<Lease>,
    identity: String,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str, identity: String) -> Self {
        info!(identity = %identity, namespace = %namespace, lease = LEASE_NAME, "Initialized leader elector");
        Self {
            leases: Api::namespaced(client, namespace),
            identity,
        }
    }

    /// Block until the lease is ours. Returns early with an error only if
    /// `shutdown` fires first.
    pub async fn acquire(&self, shutdown: &CancellationToken) -> Result<()> {
        info!(identity = %self.identity, "Waiting to acquire leader lease");
        loop {
            match self.try_acquire().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Acquired leader lease");
                    return Ok(());
                }
                Ok(false) => debug!(retry_in = ?RETRY_INTERVAL, "Lease held by another replica"),
                Err(e) => warn!(error = %e, retry_in = ?RETRY_INTERVAL, "Lease acquisition failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                _ = shutdown.cancelled() => {
                    return Err(OperatorError::Configuration(
                        "shutdown requested before the leader lease was acquired".to_string(),
                    ));
                }
            }
        }
    }

    /// Renew until the lease is lost or `shutdown` fires. Losing the lease
    /// cancels `shutdown`.
    pub async fn keep_renewed(&self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(RENEW_INTERVAL) => {}
                _ = shutdown.cancelled() => return,
            }
            match self.renew().await {
                Ok(true) => debug!("Renewed leader lease"),
                Ok(false) => {
                    error!(identity = %self.identity, "Lost leader lease");
                    shutdown.cancel();
                    return;
                }
                Err(e) => {
                    error!(error = %e, "Failed to renew leader lease");
                    shutdown.cancel();
                    return;
                }
            }
        }
    }

    /// `Ok(false)` when another replica holds the lease or won a write race.
    async fn renew(&self) -> Result<bool> {
        let lease = self.leases.get(LEASE_NAME).await?;
        if holder(&lease) != Some(self.identity.as_str()) {
            return Ok(false);
        }
        let mut updated = lease;
        if let Some(spec) = updated.spec.as_mut() {
            spec.renew_time = Some(MicroTime(Utc::now()));
        }
        self.write(&updated).await
    }

    /// Clear the holder so a standby replica can take over without waiting
    /// for expiry. Best effort.
    pub async fn release(&self) {
        let lease = match self.leases.get(LEASE_NAME).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(error = %e, "Failed to read lease for release");
                return;
            }
        };
        if holder(&lease) != Some(self.identity.as_str()) {
            debug!("Lease not held by this replica, nothing to release");
            return;
        }

        let mut updated = lease;
        if let Some(spec) = updated.spec.as_mut() {
            spec.holder_identity = None;
        }
        match self.write(&updated).await {
            Ok(true) => info!(identity = %self.identity, "Released leader lease"),
            Ok(false) => debug!("Lease changed before release"),
            Err(e) => warn!(error = %e, "Failed to release leader lease"),
        }
    }

    async fn try_acquire(&self) -> Result<bool> {
        let now = Utc::now();
        let Some(existing) = self.leases.get_opt(LEASE_NAME).await? else {
            return self.create_lease(now).await;
        };

        let ours = holder(&existing) == Some(self.identity.as_str());
        if !ours && !lease_expired(existing.spec.as_ref(), now) {
            return Ok(false);
        }

        let prev = existing.spec.clone().unwrap_or_default();
        let transitions = prev.lease_transitions.unwrap_or(0);
        let mut updated = existing;
        updated.spec = Some(LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(LEASE_DURATION_SECS),
            acquire_time: if ours { prev.acquire_time } else { Some(MicroTime(now)) },
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(if ours { transitions } else { transitions + 1 }),
            ..prev
        });
        self.write(&updated).await
    }

    async fn create_lease(&self, now: DateTime<Utc>) -> Result<bool> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION_SECS),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };
        match self.leases.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the lease; a 409 means someone else wrote first.
    async fn write(&self, lease: &Lease) -> Result<bool> {
        match self.leases.replace(LEASE_NAME, &PostParams::default(), lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

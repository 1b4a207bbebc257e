//! Leader election using Kubernetes Leases
//!
//! With `--leader-elect`, only the lease holder runs the controller. The
//! timing invariant prevents split-brain: the lease duration (30s) exceeds
//! the renew interval (10s), so a deposed leader notices loss well before
//! the expired lease can be taken over.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{Error, Result, SERVER_SIDE_APPLY_OWNER};

/// Lease name for the controller leader election
pub const LEADER_LEASE_NAME: &str = "jsonnet-controller-leader";

const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Leader elector over a coordination.k8s.io/v1 Lease
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    is_leader: Arc<AtomicBool>,
}

impl LeaderElector {
    /// Create an elector for this process identity
    pub fn new(client: Client, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: LEADER_LEASE_NAME.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Block until leadership is acquired, then return a guard that keeps
    /// renewing the lease. Dropping the guard releases leadership.
    pub async fn acquire(self: Arc<Self>) -> Result<LeaderGuard> {
        info!(identity = %self.identity, lease = %self.lease_name, "Waiting for leadership...");

        loop {
            match self.try_acquire_lease().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Leadership acquired");
                    self.is_leader.store(true, Ordering::SeqCst);
                    return Ok(self.guard());
                }
                Ok(false) => {
                    debug!(identity = %self.identity, "Lease held by another, waiting...");
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "Failed to acquire lease, retrying...");
                }
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    fn guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    async fn try_acquire_lease(&self) -> Result<bool> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();

        match api.get(&self.lease_name).await {
            Ok(lease) => {
                let spec = lease.spec.as_ref();
                let holder = spec.and_then(|s| s.holder_identity.as_ref());

                if holder == Some(&self.identity) {
                    return self.renew_lease(&api, now).await;
                }

                let renew_time = spec.and_then(|s| s.renew_time.as_ref());
                let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
                let is_expired = match (renew_time, duration_secs) {
                    (Some(rt), Some(duration)) => {
                        now > rt.0 + chrono::Duration::seconds(duration as i64)
                    }
                    _ => true,
                };

                if is_expired {
                    let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
                    self.take_over_lease(&api, now, transitions).await
                } else {
                    Ok(false)
                }
            }
            Err(kube::Error::Api(e)) if e.code == 404 => self.create_lease(&api, now).await,
            Err(e) => Err(Error::from(e)),
        }
    }

    async fn create_lease(&self, api: &Api<Lease>, now: chrono::DateTime<Utc>) -> Result<bool> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };

        match api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(identity = %self.identity, "Created new lease");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(Error::from(e)),
        }
    }

    async fn renew_lease(&self, api: &Api<Lease>, now: chrono::DateTime<Utc>) -> Result<bool> {
        let patch = serde_json::json!({
            "apiVersion": "coordination.k8s.io/v1",
            "kind": "Lease",
            "metadata": {
                "name": self.lease_name,
                "namespace": self.namespace,
            },
            "spec": {
                "renewTime": MicroTime(now),
            }
        });

        api.patch(
            &self.lease_name,
            &PatchParams::apply(SERVER_SIDE_APPLY_OWNER).force(),
            &Patch::Apply(&patch),
        )
        .await?;

        debug!(identity = %self.identity, "Lease renewed");
        Ok(true)
    }

    async fn take_over_lease(
        &self,
        api: &Api<Lease>,
        now: chrono::DateTime<Utc>,
        transitions: i32,
    ) -> Result<bool> {
        let patch = serde_json::json!({
            "apiVersion": "coordination.k8s.io/v1",
            "kind": "Lease",
            "metadata": {
                "name": self.lease_name,
                "namespace": self.namespace,
            },
            "spec": {
                "holderIdentity": self.identity,
                "acquireTime": MicroTime(now),
                "renewTime": MicroTime(now),
                "leaseDurationSeconds": LEASE_DURATION.as_secs() as i32,
                "leaseTransitions": transitions + 1,
            }
        });

        match api
            .patch(
                &self.lease_name,
                &PatchParams::apply(SERVER_SIDE_APPLY_OWNER).force(),
                &Patch::Apply(&patch),
            )
            .await
        {
            Ok(_) => {
                info!(identity = %self.identity, transitions = transitions + 1, "Took over expired lease");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(Error::from(e)),
        }
    }

    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(RENEW_INTERVAL).await;

            match self.try_acquire_lease().await {
                Ok(true) => {} // Still leader
                Ok(false) | Err(_) => {
                    warn!(identity = %self.identity, "Leadership lost");
                    self.is_leader.store(false, Ordering::SeqCst);
                    let _ = lost_tx.send(());
                    return;
                }
            }
        }
    }
}

/// Guard held while this process is the leader
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Wait until leadership is lost
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.elector.is_leader.store(false, Ordering::SeqCst);
        self.renewal_task.abort();
        info!(identity = %self.elector.identity, "Leadership released");
    }
}

//! Lease-backed leader election and the leadership gate
//!
//! Replicas of the health checker race for a `coordination.k8s.io/v1` Lease;
//! only the holder runs the watcher and scheduler. The timing contract is the
//! usual one: the renew deadline must be strictly shorter than the lease
//! duration, so a demoted leader observes the loss before a standby can take
//! over the expired lease. A stale leader may still land a status patch in
//! that window; verdicts are idempotent and the next leader's patch simply
//! overwrites it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checker::PodApi;
use crate::config::Config;
use crate::probe::Prober;
use crate::scheduler::Scheduler;
use crate::watcher::PodWatcher;
use crate::{Error, Result};

const FIELD_MANAGER: &str = "endpoint-health-checker";

/// Outcome of one acquisition attempt
enum Acquire {
    /// We now hold the lease
    Acquired,
    /// Someone else holds a live lease
    Held(Option<String>),
}

/// Leader elector over a Kubernetes Lease
///
/// Manages acquisition and renewal. At most one replica holds the lease at a
/// time; holders renew every `renew_deadline`, standbys retry every
/// `retry_period`.
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    renew_deadline: Duration,
    retry_period: Duration,
    is_leader: Arc<AtomicBool>,
}

impl LeaderElector {
    /// Create an elector from the runtime configuration
    pub fn new(client: Client, config: &Config) -> Self {
        Self {
            client,
            lease_name: config.lease_name.clone(),
            namespace: config.lease_namespace.clone(),
            identity: config.pod_name.clone(),
            lease_duration: config.lease_duration,
            renew_deadline: config.renew_deadline,
            retry_period: config.retry_period,
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    /// This replica's holder identity
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Block until leadership is acquired, then return a guard
    ///
    /// The guard maintains leadership through periodic renewal and signals
    /// through [`LeaderGuard::lost`] when it slips. Holder changes observed
    /// while waiting are logged. Returns `None` if `cancel` fires first.
    pub async fn acquire(self: Arc<Self>, cancel: &CancellationToken) -> Option<LeaderGuard> {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            "waiting for leadership"
        );

        let mut observed_holder: Option<String> = None;

        loop {
            match self.try_acquire_lease().await {
                Ok(Acquire::Acquired) => {
                    info!(identity = %self.identity, "I am the new leader");
                    self.is_leader.store(true, Ordering::SeqCst);
                    return Some(self.create_guard());
                }
                Ok(Acquire::Held(holder)) => {
                    if holder != observed_holder {
                        match &holder {
                            Some(leader) => info!(leader = %leader, "new leader is another replica"),
                            None => debug!("lease holder unknown"),
                        }
                        observed_holder = holder;
                    }
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        retry_ms = self.retry_period.as_millis(),
                        "failed to acquire lease, retrying"
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.retry_period) => {}
            }
        }
    }

    fn create_guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx,
        }
    }

    /// Try to acquire or renew the lease
    async fn try_acquire_lease(&self) -> Result<Acquire> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();

        match api.get(&self.lease_name).await {
            Ok(lease) => {
                let spec = lease.spec.as_ref();
                let holder = spec.and_then(|s| s.holder_identity.clone());

                // Already hold it? Renew.
                if holder.as_deref() == Some(&self.identity) {
                    return self.renew_lease(&api, now).await;
                }

                if spec.map(|s| lease_expired(s, now)).unwrap_or(true) {
                    let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
                    self.take_over_lease(&api, now, transitions).await
                } else {
                    Ok(Acquire::Held(holder))
                }
            }
            Err(kube::Error::Api(e)) if e.code == 404 => self.create_lease(&api, now).await,
            Err(e) => Err(e.into()),
        }
    }

    /// Create a new lease (first leader)
    async fn create_lease(&self, api: &Api<Lease>, now: DateTime<Utc>) -> Result<Acquire> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };

        match api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(identity = %self.identity, "created new lease");
                Ok(Acquire::Acquired)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(Acquire::Held(None)),
            Err(e) => Err(e.into()),
        }
    }

    /// Renew an existing lease that we hold
    async fn renew_lease(&self, api: &Api<Lease>, now: DateTime<Utc>) -> Result<Acquire> {
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
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&patch),
        )
        .await?;

        debug!(identity = %self.identity, "lease renewed");
        Ok(Acquire::Acquired)
    }

    /// Take over an expired lease
    async fn take_over_lease(
        &self,
        api: &Api<Lease>,
        now: DateTime<Utc>,
        transitions: i32,
    ) -> Result<Acquire> {
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
                "leaseDurationSeconds": self.lease_duration.as_secs() as i32,
                "leaseTransitions": transitions + 1,
            }
        });

        match api
            .patch(
                &self.lease_name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&patch),
            )
            .await
        {
            Ok(_) => {
                info!(
                    identity = %self.identity,
                    transitions = transitions + 1,
                    "took over expired lease"
                );
                Ok(Acquire::Acquired)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(Acquire::Held(None)),
            Err(e) => Err(e.into()),
        }
    }

    /// Renewal loop that runs while we hold leadership
    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(self.renew_deadline).await;

            match self.try_acquire_lease().await {
                Ok(Acquire::Acquired) => {} // Still leader
                Ok(Acquire::Held(_)) | Err(_) => {
                    warn!(identity = %self.identity, "leadership lost");
                    self.is_leader.store(false, Ordering::SeqCst);
                    let _ = lost_tx.send(());
                    return;
                }
            }
        }
    }
}

/// Whether the lease is past its validity window at `now`
///
/// A lease without a renew time or duration is treated as expired and up for
/// grabs.
fn lease_expired(spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
    match (&spec.renew_time, spec.lease_duration_seconds) {
        (Some(renewed), Some(duration)) => {
            now > renewed.0 + chrono::Duration::seconds(i64::from(duration))
        }
        _ => true,
    }
}

/// Guard that maintains leadership
///
/// While this guard exists, the elector renews the lease periodically. Use
/// [`lost`](Self::lost) to wait for leadership loss. Dropping the guard stops
/// renewal and releases leadership.
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: oneshot::Receiver<()>,
}

impl LeaderGuard {
    /// Wait until leadership is lost
    ///
    /// Cancel-safe: a wait interrupted by another `select!` branch can be
    /// resumed on a later call.
    pub async fn lost(&mut self) {
        let _ = (&mut self.lost_rx).await;
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.elector.is_leader.store(false, Ordering::SeqCst);
        self.renewal_task.abort();
        info!(identity = %self.elector.identity, "leadership released, now standby");
    }
}

/// Run the watcher and scheduler only while this replica holds the lease
///
/// On acquisition: the watcher starts under a fresh stop token and scheduling
/// is held back until the initial pod list has synced — a watcher that dies
/// before syncing is fatal, since probing a half-loaded set would thrash pod
/// status. On demotion: both components are cancelled and drained, then the
/// loop goes back to waiting for the lease (re-acquisition is possible; the
/// process does not exit). On root cancellation: tear down and return.
pub async fn run_when_leader<A, P>(
    elector: Arc<LeaderElector>,
    watcher: Arc<PodWatcher>,
    scheduler: Arc<Scheduler<A, P>>,
    cancel: CancellationToken,
) -> Result<()>
where
    A: PodApi + 'static,
    P: Prober + 'static,
{
    loop {
        let Some(mut guard) = Arc::clone(&elector).acquire(&cancel).await else {
            return Ok(());
        };
        info!(identity = %elector.identity(), "starting watcher and scheduler");

        let stop = cancel.child_token();
        let (synced_tx, mut synced_rx) = oneshot::channel();

        let watcher_handle = tokio::spawn({
            let watcher = Arc::clone(&watcher);
            let stop = stop.clone();
            async move { watcher.run(synced_tx, stop).await }
        });

        // Hold the scheduler back until the initial pod list is loaded.
        let synced = tokio::select! {
            result = &mut synced_rx => result.is_ok(),
            _ = guard.lost() => {
                warn!("leadership lost before pod cache synced");
                stop.cancel();
                let _ = watcher_handle.await;
                continue;
            }
            _ = cancel.cancelled() => {
                stop.cancel();
                let _ = watcher_handle.await;
                return Ok(());
            }
        };
        if !synced {
            stop.cancel();
            let _ = watcher_handle.await;
            return Err(Error::WatchSync);
        }

        let scheduler_handle = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            let stop = stop.clone();
            async move { scheduler.run(stop).await }
        });

        tokio::select! {
            _ = guard.lost() => {
                warn!(identity = %elector.identity(), "lost leadership, tearing down");
            }
            _ = cancel.cancelled() => {
                info!("shutdown requested, tearing down");
            }
        }

        stop.cancel();
        let _ = scheduler_handle.await;
        let _ = watcher_handle.await;
        drop(guard);

        if cancel.is_cancelled() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(renewed_secs_ago: i64, duration: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some("other".to_string()),
            renew_time: Some(MicroTime(
                Utc::now() - chrono::Duration::seconds(renewed_secs_ago),
            )),
            lease_duration_seconds: Some(duration),
            ..Default::default()
        }
    }

    #[test]
    fn test_fresh_lease_is_not_expired() {
        assert!(!lease_expired(&spec(1, 4), Utc::now()));
    }

    #[test]
    fn test_stale_lease_is_expired() {
        assert!(lease_expired(&spec(10, 4), Utc::now()));
    }

    #[test]
    fn test_lease_without_renew_time_is_expired() {
        let spec = LeaseSpec {
            holder_identity: Some("other".to_string()),
            lease_duration_seconds: Some(4),
            ..Default::default()
        };
        assert!(lease_expired(&spec, Utc::now()));
    }

    #[test]
    fn test_lease_without_duration_is_expired() {
        let spec = LeaseSpec {
            holder_identity: Some("other".to_string()),
            renew_time: Some(MicroTime(Utc::now())),
            ..Default::default()
        };
        assert!(lease_expired(&spec, Utc::now()));
    }

    #[test]
    fn test_expiry_boundary_uses_full_duration() {
        // Renewed exactly at the duration edge: not yet past the window.
        let s = spec(4, 4);
        let renewed = s.renew_time.as_ref().unwrap().0;
        assert!(!lease_expired(&s, renewed + chrono::Duration::seconds(4)));
        assert!(lease_expired(
            &s,
            renewed + chrono::Duration::seconds(4) + chrono::Duration::milliseconds(1)
        ));
    }
}

//! Probe orchestration and pod status patching
//!
//! Given a target, runs the probe engine (TCP against every declared probe
//! port, or ICMP when none are declared), computes a verdict, and patches the
//! pod's status conditions when — and only when — the verdict differs from
//! the last one written. Status patches are rate-limited upstream, so the
//! write-suppression step is a hard requirement, not an optimization.

use std::net::SocketAddr;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Pod, PodCondition};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tracing::{debug, error, info};

#[cfg(test)]
use mockall::automock;

use crate::probe::{ProbeConfig, ProbeError, Prober};
use crate::target::{Target, Verdict};
use crate::{Error, Result, READINESS_GATE_CONDITION, READY_CONDITION};

/// Pod API operations consumed by the health checker
///
/// Abstracted so tests can run without a cluster, mirroring how the real
/// client is wired in production via [`KubePodApi`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodApi: Send + Sync {
    /// Fetch a pod by identity; `None` when it no longer exists
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    /// Merge-patch the pod's status subresource with a conditions-only payload
    async fn patch_pod_status(
        &self,
        namespace: &str,
        name: &str,
        conditions: &[PodCondition],
    ) -> Result<()>;
}

/// Pod API backed by the real cluster client
#[derive(Clone)]
pub struct KubePodApi {
    client: Client,
}

impl KubePodApi {
    /// Wrap a cluster client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodApi for KubePodApi {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_pod_status(
        &self,
        namespace: &str,
        name: &str,
        conditions: &[PodCondition],
    ) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "status": {
                "conditions": conditions,
            }
        });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Runs probes against targets and writes verdicts back to pod status
pub struct HealthChecker<A, P> {
    api: A,
    prober: P,
    probe_config: ProbeConfig,
}

impl<A: PodApi, P: Prober> HealthChecker<A, P> {
    /// Create a checker over the given API seam, prober, and probe envelope
    pub fn new(api: A, prober: P, probe_config: ProbeConfig) -> Self {
        Self {
            api,
            prober,
            probe_config,
        }
    }

    /// Probe one target and reconcile the pod's status conditions
    ///
    /// Clears the target's in-flight flag on every successful return,
    /// including the suppressed-write path. Errors leave the last verdict
    /// unchanged so the next tick retries the write.
    pub async fn check_target(&self, target: &Target) -> Result<Verdict> {
        let healthy = self.probe_target(target).await?;
        let verdict = Verdict::from_healthy(healthy);

        if target.last_verdict() == verdict {
            debug!(
                pod = %format_args!("{}/{}", target.namespace, target.name),
                ?verdict,
                "verdict unchanged, skipping status update"
            );
            target.set_in_flight(false);
            return Ok(verdict);
        }

        let pod = self
            .api
            .get_pod(&target.namespace, &target.name)
            .await?
            .ok_or_else(|| Error::PodNotFound {
                namespace: target.namespace.clone(),
                name: target.name.clone(),
            })?;

        if let Some(conditions) = patched_conditions(&pod, healthy, Time(Utc::now())) {
            self.api
                .patch_pod_status(&target.namespace, &target.name, &conditions)
                .await?;
            info!(
                pod = %format_args!("{}/{}", target.namespace, target.name),
                healthy,
                "patched pod conditions"
            );
        }

        target.set_last_verdict(verdict);
        target.set_in_flight(false);
        Ok(verdict)
    }

    /// Run the probe engine for the target and reduce to a single outcome
    ///
    /// TCP mode when probe ports are declared (every port must pass), ICMP
    /// otherwise. Transient probe failures become an unhealthy outcome;
    /// only transport setup failures surface as errors.
    async fn probe_target(&self, target: &Target) -> Result<bool> {
        if !target.ports.is_empty() {
            let mut healthy = true;
            for port in &target.ports {
                let addr = SocketAddr::new(target.address, *port);
                match self.prober.tcp(addr, &self.probe_config).await {
                    Ok(()) => {
                        debug!(pod = %format_args!("{}/{}", target.namespace, target.name), port, "port probe succeeded");
                    }
                    Err(e) => {
                        healthy = false;
                        error!(
                            pod = %format_args!("{}/{}", target.namespace, target.name),
                            port,
                            error = %e,
                            "port probe failed"
                        );
                    }
                }
            }
            return Ok(healthy);
        }

        match self.prober.icmp(target.address, &self.probe_config).await {
            Ok(()) => {
                debug!(pod = %format_args!("{}/{}", target.namespace, target.name), "icmp probe succeeded");
                Ok(true)
            }
            Err(ProbeError::Socket(e)) => Err(Error::ProbeSetup(e)),
            Err(e) => {
                error!(
                    pod = %format_args!("{}/{}", target.namespace, target.name),
                    error = %e,
                    "icmp probe failed"
                );
                Ok(false)
            }
        }
    }
}

/// Compute the conditions array to patch onto the pod, if any
///
/// When the pod declares the managed readiness gate, that condition is set to
/// the verdict. An unhealthy verdict additionally forces the standard ready
/// condition to `False`. A healthy verdict on a pod without the gate needs no
/// patch at all: kubelet owns the ready condition there.
pub fn patched_conditions(pod: &Pod, healthy: bool, now: Time) -> Option<Vec<PodCondition>> {
    let has_gate = has_readiness_gate(pod);
    if healthy && !has_gate {
        return None;
    }

    let mut conditions = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.clone())
        .unwrap_or_default();

    if has_gate {
        let status = if healthy { "True" } else { "False" };
        set_condition(&mut conditions, READINESS_GATE_CONDITION, status, &now);
    }

    if !healthy {
        set_condition(&mut conditions, READY_CONDITION, "False", &now);
    }

    Some(conditions)
}

/// Whether the pod declares the managed readiness gate
pub fn has_readiness_gate(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.readiness_gates.as_ref())
        .map(|gates| {
            gates
                .iter()
                .any(|g| g.condition_type == READINESS_GATE_CONDITION)
        })
        .unwrap_or(false)
}

/// Set a condition in place, appending when absent
///
/// Both the probe and transition timestamps are overwritten on every write,
/// matching upstream behavior even when the status value did not change.
fn set_condition(conditions: &mut Vec<PodCondition>, type_: &str, status: &str, now: &Time) {
    for cond in conditions.iter_mut() {
        if cond.type_ == type_ {
            cond.status = status.to_string();
            cond.last_probe_time = Some(now.clone());
            cond.last_transition_time = Some(now.clone());
            return;
        }
    }

    conditions.push(PodCondition {
        type_: type_.to_string(),
        status: status.to_string(),
        last_probe_time: Some(now.clone()),
        last_transition_time: Some(now.clone()),
        ..Default::default()
    });
}

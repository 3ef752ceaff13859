//! Thread-safe working set of probe targets
//!
//! Targets are derived from pod events and keyed by pod IP; at most one entry
//! exists per address, and a later pod claiming the same address overwrites
//! the earlier one (last writer wins, the upstream semantic for transient
//! address reuse). Membership is event-driven: only the watcher mutates it,
//! and a pod that stops satisfying the eligibility predicates is removed only
//! by its own delete event.
//!
//! Snapshots hand out `Arc` handles to live entries. The mutable per-entry
//! fields (`in_flight`, `last_verdict`) carry their own synchronization, so a
//! worker can update a handle it captured even after the entry was replaced
//! in the map.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{ENABLED_ANNOTATION, READINESS_GATE_CONDITION, READY_CONDITION};

/// Outcome of probing a target, as last written to the pod's status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No verdict has been written yet
    Unknown,
    /// The endpoint was reachable
    Healthy,
    /// The endpoint was unreachable
    Unhealthy,
}

impl Verdict {
    /// Convert a probe outcome into a verdict
    pub fn from_healthy(healthy: bool) -> Self {
        if healthy {
            Self::Healthy
        } else {
            Self::Unhealthy
        }
    }
}

/// A pod endpoint selected for probing
///
/// Identity fields are immutable for the lifetime of the entry; `in_flight`
/// and `last_verdict` are updated by worker tasks through shared handles.
#[derive(Debug)]
pub struct Target {
    /// Namespace of the source pod
    pub namespace: String,
    /// Name of the source pod
    pub name: String,
    /// Pod IP to probe
    pub address: IpAddr,
    /// TCP ports from the pod's declared probes, sorted and deduplicated;
    /// empty means ICMP mode
    pub ports: Vec<u16>,
    in_flight: AtomicBool,
    last_verdict: Mutex<Verdict>,
}

impl Target {
    /// Build a target from a pod if it passes every eligibility predicate:
    /// running phase, non-empty parseable IP, affirmative ready condition,
    /// and health checking opted in. Returns `None` otherwise.
    pub fn from_pod(pod: &Pod) -> Option<Self> {
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let name = pod.metadata.name.clone().unwrap_or_default();

        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or_default();
        let pod_ip = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.as_deref())
            .unwrap_or_default();

        if phase != "Running" || pod_ip.is_empty() {
            debug!(pod = %format_args!("{namespace}/{name}"), phase, pod_ip, "skipping pod: not a running endpoint");
            return None;
        }

        let address: IpAddr = match pod_ip.parse() {
            Ok(ip) => ip,
            Err(_) => {
                warn!(pod = %format_args!("{namespace}/{name}"), pod_ip, "skipping pod: unparseable pod IP");
                return None;
            }
        };

        if !health_check_enabled(pod) {
            debug!(pod = %format_args!("{namespace}/{name}"), "skipping pod: health check not enabled");
            return None;
        }

        if !is_pod_ready(pod) {
            debug!(pod = %format_args!("{namespace}/{name}"), "skipping pod: waiting for initial readiness");
            return None;
        }

        Some(Self {
            namespace,
            name,
            address,
            ports: probe_ports(pod),
            in_flight: AtomicBool::new(false),
            last_verdict: Mutex::new(Verdict::Unknown),
        })
    }

    /// Whether a probe task is currently dispatched for this entry
    pub fn in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Set or clear the in-flight flag
    pub fn set_in_flight(&self, value: bool) {
        self.in_flight.store(value, Ordering::Release);
    }

    /// The verdict last successfully written to the pod's status
    pub fn last_verdict(&self) -> Verdict {
        *self.last_verdict.lock()
    }

    /// Record a successfully written verdict
    pub fn set_last_verdict(&self, verdict: Verdict) {
        *self.last_verdict.lock() = verdict;
    }
}

/// Working set of probe targets keyed by pod IP
#[derive(Default)]
pub struct TargetSet {
    targets: RwLock<HashMap<IpAddr, Arc<Target>>>,
}

impl TargetSet {
    /// Create an empty target set
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or overwrite the entry for the pod's address
    ///
    /// Applies the eligibility predicates; a pod that fails them is a no-op
    /// (an existing entry for the same pod is left alone — removal is
    /// delete-driven only). A passing pod gets a fresh entry with
    /// `in_flight = false` and an unknown verdict.
    pub fn upsert(&self, pod: &Pod) {
        let Some(target) = Target::from_pod(pod) else {
            return;
        };

        let mut targets = self.targets.write();
        let address = target.address;
        targets.insert(address, Arc::new(target));
        info!(
            pod = %format_args!("{}/{}", pod.metadata.namespace.as_deref().unwrap_or_default(), pod.metadata.name.as_deref().unwrap_or_default()),
            %address,
            total = targets.len(),
            "added pod to target set"
        );
    }

    /// Remove the entry at the pod's address, if any
    pub fn delete(&self, pod: &Pod) {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        let pod_ip = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.as_deref())
            .unwrap_or_default();

        let Ok(address) = pod_ip.parse::<IpAddr>() else {
            debug!(pod = %format_args!("{namespace}/{name}"), pod_ip, "cannot delete pod without usable IP");
            return;
        };

        let mut targets = self.targets.write();
        if targets.remove(&address).is_some() {
            info!(pod = %format_args!("{namespace}/{name}"), %address, "deleted pod from target set");
        } else {
            debug!(pod = %format_args!("{namespace}/{name}"), %address, "pod not found in target set");
        }
    }

    /// Remove the first entry matching the given identity
    ///
    /// Linear scan; used when a delete event carries no address.
    pub fn delete_by_identity(&self, namespace: &str, name: &str) {
        let mut targets = self.targets.write();
        let found = targets
            .iter()
            .find(|(_, t)| t.namespace == namespace && t.name == name)
            .map(|(addr, _)| *addr);

        match found {
            Some(address) => {
                targets.remove(&address);
                info!(pod = %format_args!("{namespace}/{name}"), %address, "deleted pod from target set");
            }
            None => {
                debug!(pod = %format_args!("{namespace}/{name}"), "pod not found in target set");
            }
        }
    }

    /// Set the in-flight flag on the entry at `address`
    ///
    /// Returns whether an entry existed.
    pub fn mark_in_flight(&self, address: IpAddr, value: bool) -> bool {
        let targets = self.targets.read();
        match targets.get(&address) {
            Some(target) => {
                target.set_in_flight(value);
                true
            }
            None => {
                warn!(%address, "no target at address when marking in-flight");
                false
            }
        }
    }

    /// Handles to every entry without an active probe
    pub fn available_snapshot(&self) -> Vec<Arc<Target>> {
        let targets = self.targets.read();
        targets
            .values()
            .filter(|t| !t.in_flight())
            .cloned()
            .collect()
    }

    /// Total entry count and a per-namespace tally
    pub fn stats(&self) -> (usize, HashMap<String, usize>) {
        let targets = self.targets.read();
        let mut by_namespace: HashMap<String, usize> = HashMap::new();
        for target in targets.values() {
            *by_namespace.entry(target.namespace.clone()).or_default() += 1;
        }
        (targets.len(), by_namespace)
    }
}

/// Whether the pod opted in to endpoint health checking
///
/// An `endpoint-health-checker.io/enabled` annotation decides outright when
/// present; otherwise a readiness gate of the managed condition type opts in
/// (the legacy mechanism).
pub fn health_check_enabled(pod: &Pod) -> bool {
    if let Some(annotations) = &pod.metadata.annotations {
        if let Some(value) = annotations.get(ENABLED_ANNOTATION) {
            return value == "true";
        }
    }

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

/// Whether the pod's kubelet-owned ready condition is affirmative
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conds| conds.iter().find(|c| c.type_ == READY_CONDITION))
        .map(|c| c.status == "True")
        .unwrap_or(false)
}

/// TCP ports declared by the pod's liveness and readiness probes
///
/// Unions TCP socket, HTTP get, and gRPC probe ports across all containers,
/// deduplicated and sorted. Named (non-numeric) ports are skipped.
pub fn probe_ports(pod: &Pod) -> Vec<u16> {
    let mut ports = BTreeSet::new();

    let containers = pod.spec.as_ref().map(|s| s.containers.as_slice());
    for container in containers.unwrap_or_default() {
        for probe in [&container.liveness_probe, &container.readiness_probe]
            .into_iter()
            .flatten()
        {
            if let Some(tcp) = &probe.tcp_socket {
                if let Some(port) = numeric_port(&tcp.port) {
                    ports.insert(port);
                }
            }
            if let Some(http) = &probe.http_get {
                if let Some(port) = numeric_port(&http.port) {
                    ports.insert(port);
                }
            }
            if let Some(grpc) = &probe.grpc {
                if let Ok(port) = u16::try_from(grpc.port) {
                    ports.insert(port);
                }
            }
        }
    }

    ports.into_iter().collect()
}

fn numeric_port(port: &IntOrString) -> Option<u16> {
    match port {
        IntOrString::Int(value) => u16::try_from(*value).ok(),
        IntOrString::String(_) => None,
    }
}

/// Pod fixtures shared by tests across modules
#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    /// A running, ready pod opted in via annotation at the given IP
    pub(crate) fn running_pod(namespace: &str, name: &str, ip: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                annotations: Some(BTreeMap::from([(
                    ENABLED_ANNOTATION.to_string(),
                    "true".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(PodSpec::default()),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                pod_ip: Some(ip.to_string()),
                conditions: Some(vec![PodCondition {
                    type_: READY_CONDITION.to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }
}

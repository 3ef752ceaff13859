//! Endpoint Health Checker - active reachability probing for Kubernetes pods
//!
//! The cluster's node-failure detection is too slow to pull dead pods out of
//! service rotation promptly. This controller fills that gap: it watches all
//! pods, keeps an in-memory working set of the ones that opted in, probes each
//! of them every interval over TCP (or ICMP when no probe ports are declared),
//! and writes the verdict back into the pod's status conditions so the service
//! layer reacts within one probe interval.
//!
//! Only the leader replica probes; leadership is coordinated through a
//! `coordination.k8s.io/v1` Lease.
//!
//! # Modules
//!
//! - [`config`] - Runtime configuration and validation
//! - [`probe`] - TCP connect and ICMP echo probes with retry envelopes
//! - [`target`] - Thread-safe working set of probe targets
//! - [`watcher`] - Pod watch stream feeding the target set
//! - [`checker`] - Probe orchestration and pod status patching
//! - [`scheduler`] - Periodic dispatch onto a bounded worker pool
//! - [`leadership`] - Lease-backed leader election and the leadership gate
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod checker;
pub mod config;
pub mod error;
pub mod leadership;
pub mod probe;
pub mod scheduler;
pub mod target;
pub mod watcher;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Annotation that opts a pod in to endpoint health checking when set to `"true"`
pub const ENABLED_ANNOTATION: &str = "endpoint-health-checker.io/enabled";

/// Readiness gate condition type managed by this controller
///
/// Declaring a readiness gate of this type is the legacy opt-in mechanism and
/// also tells the controller to publish its verdict under this condition.
pub const READINESS_GATE_CONDITION: &str = "endpointHealthCheckSuccess";

/// The standard pod ready condition type
pub const READY_CONDITION: &str = "Ready";

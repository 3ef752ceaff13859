//! Runtime configuration for the health checker
//!
//! Values arrive from CLI flags with environment fallbacks (parsed in `main`)
//! and are validated here before any component starts. Bad configuration is
//! fatal at startup.

use std::time::Duration;

use crate::{Error, Result};

/// Default probe interval
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Default per-attempt probe timeout
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Default worker pool size
pub const DEFAULT_WORKER_COUNT: usize = 10;

/// Default additional probe attempts beyond the first
///
/// The distribution chart historically shipped 10; the binary defaults to 3.
/// Override with `HEALTH_CHECK_RETRY_COUNT`.
pub const DEFAULT_RETRY_COUNT: u32 = 3;

/// Default leader election lease name
pub const DEFAULT_LEASE_NAME: &str = "endpoint-health-checker-leader";

/// Default lease duration
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(4);

/// Default lease renew deadline
pub const DEFAULT_RENEW_DEADLINE: Duration = Duration::from_secs(2);

/// Default lease acquisition retry period
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_millis(500);

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Scheduler tick period
    pub probe_interval: Duration,
    /// Ceiling for one probe attempt
    pub probe_timeout: Duration,
    /// Worker pool size for concurrent probes
    pub worker_count: usize,
    /// Additional probe attempts beyond the first
    pub retry_count: u32,
    /// This replica's identity for leader election
    pub pod_name: String,
    /// Namespace this replica runs in
    pub pod_namespace: String,
    /// Leader election lease name
    pub lease_name: String,
    /// Namespace holding the leader election lease
    pub lease_namespace: String,
    /// How long a held lease is valid
    pub lease_duration: Duration,
    /// How often the leader renews; must be shorter than the lease duration
    pub renew_deadline: Duration,
    /// How often a standby retries acquisition
    pub retry_period: Duration,
}

impl Config {
    /// Validate the configuration, returning the first violation found
    pub fn validate(&self) -> Result<()> {
        if self.probe_interval.is_zero() {
            return Err(Error::config("health check interval must be positive"));
        }
        if self.probe_timeout.is_zero() {
            return Err(Error::config("health check timeout must be positive"));
        }
        if self.worker_count == 0 {
            return Err(Error::config("health check concurrency must be positive"));
        }
        if self.pod_name.is_empty() {
            return Err(Error::config("pod name cannot be empty"));
        }
        if self.pod_namespace.is_empty() {
            return Err(Error::config("pod namespace cannot be empty"));
        }
        if self.lease_name.is_empty() {
            return Err(Error::config("lease name cannot be empty"));
        }
        if self.lease_duration.is_zero() {
            return Err(Error::config("lease duration must be positive"));
        }
        if self.renew_deadline.is_zero() {
            return Err(Error::config("renew deadline must be positive"));
        }
        if self.retry_period.is_zero() {
            return Err(Error::config("retry period must be positive"));
        }
        if self.renew_deadline >= self.lease_duration {
            return Err(Error::config(
                "renew deadline must be less than lease duration",
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            probe_interval: DEFAULT_PROBE_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            worker_count: DEFAULT_WORKER_COUNT,
            retry_count: DEFAULT_RETRY_COUNT,
            pod_name: String::new(),
            pod_namespace: "kube-system".to_string(),
            lease_name: DEFAULT_LEASE_NAME.to_string(),
            lease_namespace: "kube-system".to_string(),
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_deadline: DEFAULT_RENEW_DEADLINE,
            retry_period: DEFAULT_RETRY_PERIOD,
        }
    }
}

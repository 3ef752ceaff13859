//! Endpoint Health Checker - active reachability probing for Kubernetes pods

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use endpoint_health_checker::checker::{HealthChecker, KubePodApi};
use endpoint_health_checker::config::Config;
use endpoint_health_checker::leadership::{run_when_leader, LeaderElector};
use endpoint_health_checker::probe::{NetProber, ProbeConfig};
use endpoint_health_checker::scheduler::Scheduler;
use endpoint_health_checker::target::TargetSet;
use endpoint_health_checker::watcher::PodWatcher;

/// Probes opted-in pod endpoints and writes verdicts into pod status
#[derive(Parser, Debug)]
#[command(name = "endpoint-health-checker", version, about, long_about = None)]
struct Cli {
    /// Scheduler tick period in milliseconds
    #[arg(long, env = "HEALTH_CHECK_INTERVAL_MS", default_value_t = 1_000)]
    probe_interval_ms: u64,

    /// Ceiling for one probe attempt in milliseconds
    #[arg(long, env = "HEALTH_CHECK_TIMEOUT_MS", default_value_t = 1_000)]
    probe_timeout_ms: u64,

    /// Worker pool size for concurrent probes
    #[arg(long, env = "HEALTH_CHECK_CONCURRENCY", default_value_t = 10)]
    workers: usize,

    /// Additional probe attempts beyond the first
    #[arg(long, env = "HEALTH_CHECK_RETRY_COUNT", default_value_t = 3)]
    retry_count: u32,

    /// Holder identity for leader election (defaults to the pod name)
    #[arg(long, env = "POD_NAME", default_value = "")]
    pod_name: String,

    /// Namespace this replica runs in; also holds the election lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "kube-system")]
    pod_namespace: String,

    /// Name of the leader election lease
    #[arg(long, env = "LEASE_NAME", default_value = "endpoint-health-checker-leader")]
    lease_name: String,

    /// How long a held lease is valid, in milliseconds
    #[arg(long, env = "LEASE_DURATION_MS", default_value_t = 4_000)]
    lease_duration_ms: u64,

    /// Leader renew cadence in milliseconds; must be below the lease duration
    #[arg(long, env = "RENEW_DEADLINE_MS", default_value_t = 2_000)]
    renew_deadline_ms: u64,

    /// Standby acquisition retry cadence in milliseconds
    #[arg(long, env = "RETRY_PERIOD_MS", default_value_t = 500)]
    retry_period_ms: u64,
}

impl Cli {
    fn into_config(self) -> Config {
        let pod_name = if self.pod_name.is_empty() {
            std::env::var("HOSTNAME").unwrap_or_else(|_| "endpoint-health-checker".to_string())
        } else {
            self.pod_name
        };

        Config {
            probe_interval: Duration::from_millis(self.probe_interval_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            worker_count: self.workers,
            retry_count: self.retry_count,
            pod_name,
            pod_namespace: self.pod_namespace.clone(),
            lease_name: self.lease_name,
            lease_namespace: self.pod_namespace,
            lease_duration: Duration::from_millis(self.lease_duration_ms),
            renew_deadline: Duration::from_millis(self.renew_deadline_ms),
            retry_period: Duration::from_millis(self.retry_period_ms),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install crypto provider");

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = Cli::parse().into_config();
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    info!(
        interval_ms = config.probe_interval.as_millis(),
        timeout_ms = config.probe_timeout.as_millis(),
        workers = config.worker_count,
        retries = config.retry_count,
        identity = %config.pod_name,
        lease = %format_args!("{}/{}", config.lease_namespace, config.lease_name),
        "endpoint health checker starting"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {e}"))?;

    let targets = Arc::new(TargetSet::new());
    let probe_config = ProbeConfig {
        retry_count: config.retry_count,
        attempt_timeout: config.probe_timeout,
    };
    let checker = Arc::new(HealthChecker::new(
        KubePodApi::new(client.clone()),
        NetProber,
        probe_config,
    ));
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&targets),
        checker,
        config.probe_interval,
        config.worker_count,
    ));
    let watcher = Arc::new(PodWatcher::new(client.clone(), targets));
    let elector = Arc::new(LeaderElector::new(client, &config));

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
            }
            cancel.cancel();
        }
    });

    run_when_leader(elector, watcher, scheduler, cancel).await?;

    info!("endpoint health checker shut down");
    Ok(())
}

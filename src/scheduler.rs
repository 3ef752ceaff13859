//! Periodic dispatch of health checks onto a bounded worker pool
//!
//! A single ticker snapshots the available targets every interval and spawns
//! one task per entry. Task concurrency is capped by a semaphore sized at
//! configuration time; submission itself never blocks the ticker, so overflow
//! queues on the semaphore rather than skipping ticks. A target already
//! dispatched but not yet finished stays flagged in-flight and is skipped by
//! later ticks, so slow probes never stack up against the same address.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checker::{HealthChecker, PodApi};
use crate::probe::Prober;
use crate::target::TargetSet;

/// Last-resort ceiling for one health check task, independent of the probe
/// envelope
const TASK_DEADLINE: Duration = Duration::from_secs(10);

/// Schedules health checks for the target set at a fixed interval
pub struct Scheduler<A, P> {
    targets: Arc<TargetSet>,
    checker: Arc<HealthChecker<A, P>>,
    interval: Duration,
    worker_count: usize,
}

impl<A: PodApi + 'static, P: Prober + 'static> Scheduler<A, P> {
    /// Create a scheduler over the given target set and checker
    pub fn new(
        targets: Arc<TargetSet>,
        checker: Arc<HealthChecker<A, P>>,
        interval: Duration,
        worker_count: usize,
    ) -> Self {
        Self {
            targets,
            checker,
            interval,
            worker_count,
        }
    }

    /// Tick until cancelled, then drain in-flight tasks before returning
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            interval_ms = self.interval.as_millis(),
            workers = self.worker_count,
            "starting health check scheduler"
        );

        let pool = Arc::new(Semaphore::new(self.worker_count));
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of a tokio interval completes immediately; consume
        // it so probing starts one full interval after leadership.
        ticker.tick().await;

        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("health check scheduler stopping, draining in-flight tasks");
                    while tasks.join_next().await.is_some() {}
                    info!("health check scheduler stopped");
                    return;
                }
                _ = ticker.tick() => {
                    // Reap finished tasks so the set does not grow unbounded.
                    while tasks.try_join_next().is_some() {}
                    self.dispatch(&pool, &cancel, &mut tasks);
                }
            }
        }
    }

    /// Submit one task per available target
    fn dispatch(
        &self,
        pool: &Arc<Semaphore>,
        cancel: &CancellationToken,
        tasks: &mut JoinSet<()>,
    ) {
        let available = self.targets.available_snapshot();
        if available.is_empty() {
            debug!("no available targets for health check");
            return;
        }

        let (total, by_namespace) = self.targets.stats();
        debug!(
            available = available.len(),
            total,
            ?by_namespace,
            busy_workers = self.worker_count.saturating_sub(pool.available_permits()),
            "dispatching health check tasks"
        );

        for target in available {
            if !self.targets.mark_in_flight(target.address, true) {
                // Entry vanished between snapshot and dispatch.
                continue;
            }

            let checker = Arc::clone(&self.checker);
            let pool = Arc::clone(pool);
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let Ok(_permit) = pool.acquire_owned().await else {
                    target.set_in_flight(false);
                    return;
                };

                if cancel.is_cancelled() {
                    debug!(
                        pod = %format_args!("{}/{}", target.namespace, target.name),
                        "skipping health check: scheduler stopped"
                    );
                    target.set_in_flight(false);
                    return;
                }

                let started = Instant::now();
                let outcome =
                    tokio::time::timeout(TASK_DEADLINE, checker.check_target(&target)).await;
                let elapsed = started.elapsed();

                match outcome {
                    Ok(Ok(verdict)) => {
                        debug!(
                            pod = %format_args!("{}/{}", target.namespace, target.name),
                            ?verdict,
                            elapsed_ms = elapsed.as_millis(),
                            "health check completed"
                        );
                    }
                    Ok(Err(e)) if e.is_not_found() => {
                        info!(
                            pod = %format_args!("{}/{}", target.namespace, target.name),
                            "pod disappeared before status update, awaiting watcher removal"
                        );
                        target.set_in_flight(false);
                    }
                    Ok(Err(e)) => {
                        warn!(
                            pod = %format_args!("{}/{}", target.namespace, target.name),
                            error = %e,
                            "health check failed"
                        );
                        target.set_in_flight(false);
                    }
                    Err(_) => {
                        warn!(
                            pod = %format_args!("{}/{}", target.namespace, target.name),
                            deadline_ms = TASK_DEADLINE.as_millis(),
                            "health check exceeded task deadline"
                        );
                        target.set_in_flight(false);
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::PodApi;
    use crate::probe::{ProbeConfig, ProbeError, Prober};
    use crate::target::fixtures::running_pod;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{Pod, PodCondition};
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};
    use std::net::{IpAddr, SocketAddr};

    /// Prober that records which addresses it saw and how many probes ran
    /// against each address at once.
    struct ScriptedProber {
        delay: Duration,
        seen: Mutex<HashSet<IpAddr>>,
        active: Mutex<HashMap<IpAddr, usize>>,
        max_concurrent_per_addr: Mutex<usize>,
    }

    impl ScriptedProber {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                seen: Mutex::new(HashSet::new()),
                active: Mutex::new(HashMap::new()),
                max_concurrent_per_addr: Mutex::new(0),
            }
        }

        async fn record(&self, addr: IpAddr) {
            {
                let mut active = self.active.lock();
                let count = active.entry(addr).or_default();
                *count += 1;
                let mut max = self.max_concurrent_per_addr.lock();
                *max = (*max).max(*count);
            }
            self.seen.lock().insert(addr);
            tokio::time::sleep(self.delay).await;
            *self.active.lock().entry(addr).or_default() -= 1;
        }
    }

    #[async_trait]
    impl Prober for Arc<ScriptedProber> {
        async fn tcp(&self, addr: SocketAddr, _config: &ProbeConfig) -> Result<(), ProbeError> {
            self.record(addr.ip()).await;
            Ok(())
        }

        async fn icmp(&self, addr: IpAddr, _config: &ProbeConfig) -> Result<(), ProbeError> {
            self.record(addr).await;
            Ok(())
        }
    }

    /// Pod API stub: every pod exists and has no readiness gate, so healthy
    /// verdicts never patch and unhealthy ones would.
    struct StubApi;

    #[async_trait]
    impl PodApi for StubApi {
        async fn get_pod(&self, namespace: &str, name: &str) -> crate::Result<Option<Pod>> {
            Ok(Some(running_pod(namespace, name, "10.0.0.1")))
        }

        async fn patch_pod_status(
            &self,
            _namespace: &str,
            _name: &str,
            _conditions: &[PodCondition],
        ) -> crate::Result<()> {
            Ok(())
        }
    }

    fn build(
        targets: &Arc<TargetSet>,
        prober: Arc<ScriptedProber>,
        interval: Duration,
        workers: usize,
    ) -> Scheduler<StubApi, Arc<ScriptedProber>> {
        let config = ProbeConfig {
            retry_count: 0,
            attempt_timeout: Duration::from_millis(50),
        };
        let checker = Arc::new(HealthChecker::new(StubApi, prober, config));
        Scheduler::new(Arc::clone(targets), checker, interval, workers)
    }

    fn populate(targets: &TargetSet, count: usize) -> Vec<IpAddr> {
        (0..count)
            .map(|i| {
                let ip = format!("10.0.0.{}", i + 10);
                targets.upsert(&running_pod("default", &format!("web-{i}"), &ip));
                ip.parse().unwrap()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_pool_of_one_eventually_probes_every_target() {
        let targets = Arc::new(TargetSet::new());
        let addresses = populate(&targets, 4);
        let prober = Arc::new(ScriptedProber::new(Duration::from_millis(5)));

        let scheduler = Arc::new(build(&targets, Arc::clone(&prober), Duration::from_millis(20), 1));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            let cancel = cancel.clone();
            async move { scheduler.run(cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();
        handle.await.unwrap();

        let seen = prober.seen.lock();
        for addr in addresses {
            assert!(seen.contains(&addr), "address {addr} never probed");
        }
    }

    #[tokio::test]
    async fn test_no_target_concurrent_with_itself() {
        let targets = Arc::new(TargetSet::new());
        populate(&targets, 3);
        // Probes outlast the interval by 3x; without in-flight suppression
        // every tick would stack another probe onto each address.
        let prober = Arc::new(ScriptedProber::new(Duration::from_millis(30)));

        let scheduler = Arc::new(build(&targets, Arc::clone(&prober), Duration::from_millis(10), 8));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            let cancel = cancel.clone();
            async move { scheduler.run(cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(*prober.max_concurrent_per_addr.lock(), 1);
        assert!(!prober.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_manually_flagged_target_is_skipped() {
        let targets = Arc::new(TargetSet::new());
        let addresses = populate(&targets, 2);
        targets.mark_in_flight(addresses[0], true);

        let prober = Arc::new(ScriptedProber::new(Duration::from_millis(1)));
        let scheduler = Arc::new(build(&targets, Arc::clone(&prober), Duration::from_millis(10), 4));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            let cancel = cancel.clone();
            async move { scheduler.run(cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await.unwrap();

        let seen = prober.seen.lock();
        assert!(!seen.contains(&addresses[0]));
        assert!(seen.contains(&addresses[1]));
    }

    #[tokio::test]
    async fn test_cancellation_drains_and_returns() {
        let targets = Arc::new(TargetSet::new());
        populate(&targets, 2);
        let prober = Arc::new(ScriptedProber::new(Duration::from_millis(80)));

        let scheduler = Arc::new(build(&targets, Arc::clone(&prober), Duration::from_millis(10), 4));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            let cancel = cancel.clone();
            async move { scheduler.run(cancel).await }
        });

        // Let one dispatch land, then cancel mid-probe.
        tokio::time::sleep(Duration::from_millis(25)).await;
        cancel.cancel();
        handle.await.unwrap();

        // run() only returns after every in-flight task has completed.
        assert!(prober.active.lock().values().all(|&n| n == 0));
    }
}

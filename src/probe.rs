//! TCP connect and ICMP echo probes with retry envelopes
//!
//! Both probes take the target address, a retry count, and a per-attempt
//! timeout. A probe succeeds on the first successful attempt and fails after
//! `retry_count + 1` attempts, carrying the last underlying cause.
//!
//! Failed TCP attempts that return faster than the attempt timeout (e.g.
//! connection refused) wait out the remainder before retrying, so one probe's
//! attempts cannot pile up inside a single scheduler interval. ICMP attempts
//! already block for the reply deadline, so no spacing is applied there.
//!
//! Probes are stateless and safe to run concurrently against the same or
//! distinct addresses. ICMP requires the privilege to open raw sockets.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use surge_ping::{Client as PingClient, Config as PingConfig, PingIdentifier, PingSequence, ICMP};
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Retry and timeout envelope shared by both probe kinds
#[derive(Debug, Clone, Copy)]
pub struct ProbeConfig {
    /// Additional attempts beyond the first
    pub retry_count: u32,
    /// Ceiling for a single attempt
    pub attempt_timeout: Duration,
}

/// Probe failure cause
#[derive(Debug, Error)]
pub enum ProbeError {
    /// TCP connection establishment failed
    #[error("tcp connect to {addr} failed: {source}")]
    Connect {
        /// The probed address and port
        addr: SocketAddr,
        /// The underlying connect error
        source: std::io::Error,
    },

    /// A single attempt exceeded its timeout
    #[error("probe attempt timed out after {0:?}")]
    Timeout(Duration),

    /// The ICMP transport could not be opened (typically missing raw-socket
    /// privilege); retrying within the envelope cannot help
    #[error("icmp socket setup failed: {0}")]
    Socket(#[source] std::io::Error),

    /// No echo reply was received within the attempt timeout
    #[error("no icmp echo reply from {addr}: {reason}")]
    NoReply {
        /// The pinged address
        addr: IpAddr,
        /// Cause reported by the ICMP transport
        reason: String,
    },

    /// All attempts failed; carries the final cause
    #[error("probe failed after {attempts} attempts: {source}")]
    Exhausted {
        /// Total attempts made (`retry_count + 1`)
        attempts: u32,
        /// The last attempt's failure
        #[source]
        source: Box<ProbeError>,
    },
}

/// Reachability probe operations, abstracted for testing
///
/// The scheduler and health checker only see this trait; production wires in
/// [`NetProber`], tests script outcomes with the generated mock.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Prober: Send + Sync {
    /// TCP connect probe against `addr` under the given envelope
    async fn tcp(&self, addr: SocketAddr, config: &ProbeConfig) -> Result<(), ProbeError>;

    /// ICMP echo probe against `addr` under the given envelope
    async fn icmp(&self, addr: IpAddr, config: &ProbeConfig) -> Result<(), ProbeError>;
}

/// Prober that performs real network I/O
#[derive(Clone, Copy, Default)]
pub struct NetProber;

#[async_trait]
impl Prober for NetProber {
    async fn tcp(&self, addr: SocketAddr, config: &ProbeConfig) -> Result<(), ProbeError> {
        tcp_probe_with_retry(addr, config).await
    }

    async fn icmp(&self, addr: IpAddr, config: &ProbeConfig) -> Result<(), ProbeError> {
        icmp_probe_with_retry(addr, config).await
    }
}

/// TCP connect probe with retries
///
/// Success is establishing the transport; the connection is closed
/// immediately. Any connect-phase error counts as a failed attempt.
pub async fn tcp_probe_with_retry(
    addr: SocketAddr,
    config: &ProbeConfig,
) -> Result<(), ProbeError> {
    let attempts = config.retry_count.saturating_add(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let started = Instant::now();

        let err = match tcp_attempt(addr, config.attempt_timeout).await {
            Ok(()) => {
                if attempt > 1 {
                    debug!(%addr, attempt, attempts, "tcp probe succeeded after retry");
                }
                return Ok(());
            }
            Err(e) => e,
        };

        if attempt >= attempts {
            return Err(ProbeError::Exhausted {
                attempts,
                source: Box::new(err),
            });
        }

        // A refused connection fails in microseconds; wait out the rest of
        // the attempt budget so retries stay paced to the probe interval.
        match config.attempt_timeout.checked_sub(started.elapsed()) {
            Some(remaining) if !remaining.is_zero() => {
                debug!(
                    %addr,
                    attempt,
                    attempts,
                    error = %err,
                    wait_ms = remaining.as_millis(),
                    "tcp probe attempt failed, waiting before retry"
                );
                tokio::time::sleep(remaining).await;
            }
            _ => {
                debug!(%addr, attempt, attempts, error = %err, "tcp probe attempt failed, retrying immediately");
            }
        }
    }
}

/// ICMP echo probe with retries
///
/// Sends one echo request per attempt and waits up to the attempt timeout for
/// a reply. Socket setup failures abort the envelope immediately, since they
/// will not heal between attempts.
pub async fn icmp_probe_with_retry(addr: IpAddr, config: &ProbeConfig) -> Result<(), ProbeError> {
    let attempts = config.retry_count.saturating_add(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let err = match icmp_attempt(addr, config.attempt_timeout).await {
            Ok(()) => {
                if attempt > 1 {
                    debug!(%addr, attempt, attempts, "icmp probe succeeded after retry");
                }
                return Ok(());
            }
            Err(e) => e,
        };

        if matches!(err, ProbeError::Socket(_)) {
            return Err(err);
        }

        if attempt >= attempts {
            return Err(ProbeError::Exhausted {
                attempts,
                source: Box::new(err),
            });
        }

        debug!(%addr, attempt, attempts, error = %err, "icmp probe attempt failed, retrying");
    }
}

async fn tcp_attempt(addr: SocketAddr, timeout: Duration) -> Result<(), ProbeError> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            drop(stream);
            Ok(())
        }
        Ok(Err(source)) => Err(ProbeError::Connect { addr, source }),
        Err(_) => Err(ProbeError::Timeout(timeout)),
    }
}

async fn icmp_attempt(addr: IpAddr, timeout: Duration) -> Result<(), ProbeError> {
    let config = match addr {
        IpAddr::V4(_) => PingConfig::default(),
        IpAddr::V6(_) => PingConfig::builder().kind(ICMP::V6).build(),
    };

    let client =
        PingClient::new(&config).map_err(|e| ProbeError::Socket(std::io::Error::other(e)))?;
    let mut pinger = client.pinger(addr, PingIdentifier(rand::random())).await;
    pinger.timeout(timeout);

    match pinger.ping(PingSequence(0), &[0u8; 56]).await {
        Ok(_) => Ok(()),
        Err(e) => Err(ProbeError::NoReply {
            addr,
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use tokio::net::TcpListener;

    fn fast_config(retry_count: u32) -> ProbeConfig {
        ProbeConfig {
            retry_count,
            attempt_timeout: Duration::from_millis(50),
        }
    }

    /// Bind then drop a listener to obtain a port that refuses connections.
    async fn closed_port() -> SocketAddr {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    #[tokio::test]
    async fn test_tcp_probe_succeeds_against_listener() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let started = Instant::now();
        tcp_probe_with_retry(addr, &fast_config(3))
            .await
            .expect("listener should be reachable");
        // First success short-circuits; no retry spacing should apply.
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_tcp_probe_exhausts_exact_attempt_count() {
        let addr = closed_port().await;

        match tcp_probe_with_retry(addr, &fast_config(2)).await {
            Err(ProbeError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tcp_probe_zero_retries_is_single_attempt() {
        let addr = closed_port().await;

        match tcp_probe_with_retry(addr, &fast_config(0)).await {
            Err(ProbeError::Exhausted { attempts, .. }) => assert_eq!(attempts, 1),
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tcp_probe_wall_clock_stays_within_envelope() {
        let addr = closed_port().await;
        let config = fast_config(3);

        let started = Instant::now();
        let result = tcp_probe_with_retry(addr, &config).await;
        let elapsed = started.elapsed();

        assert!(result.is_err());
        // 4 attempts x 50ms budget, plus slop. Refused connections return
        // fast, so nearly all of this is deliberate retry spacing.
        assert!(
            elapsed <= Duration::from_millis(4 * 50 + 150),
            "probe took {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn test_tcp_probe_spaces_fast_failures() {
        let addr = closed_port().await;
        let config = fast_config(2);

        let started = Instant::now();
        let _ = tcp_probe_with_retry(addr, &config).await;
        let elapsed = started.elapsed();

        // Two inter-attempt waits of ~50ms each must have happened.
        assert!(
            elapsed >= Duration::from_millis(80),
            "retries not spaced: {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn test_tcp_probe_safe_under_concurrent_invocation() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let mut handles = Vec::new();
        for _ in 0..8 {
            handles.push(tokio::spawn(async move {
                tcp_probe_with_retry(addr, &fast_config(1)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().expect("concurrent probe failed");
        }
    }

    #[tokio::test]
    async fn test_tcp_probe_unroutable_times_out() {
        // TEST-NET-1 is guaranteed unroutable; connect attempts hang until
        // the attempt timeout trips rather than being refused.
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 9));

        match tcp_probe_with_retry(addr, &fast_config(0)).await {
            Err(ProbeError::Exhausted { source, .. }) => {
                assert!(matches!(*source, ProbeError::Timeout(_) | ProbeError::Connect { .. }));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }
}

//! Health checks for the supervised process.
//!
//! Startup checks block until the game server is usable or the check times
//! out. After startup, [`HealthTracker`] turns periodic probe results into
//! a healthy/unhealthy signal.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use arena_core::{HealthKind, Protocol};
use regex::Regex;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::HealthSettings;
use crate::error::{SupervisorError, SupervisorResult};

/// Consecutive failed probes that mark a running process unhealthy.
pub const UNHEALTHY_THRESHOLD: u32 = 3;

const UDP_REPLY_WAIT: Duration = Duration::from_millis(200);

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    Healthy,
    /// The probe ran and the endpoint refused or did not answer in time.
    Unhealthy,
}

/// Dial `port` on the loopback interface.
///
/// TCP succeeds once a connection is accepted. UDP sends an empty datagram
/// and fails only when the kernel reports the port unreachable.
pub async fn probe_port(port: u16, protocol: Protocol, timeout: Duration) -> ProbeResult {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let result = tokio::time::timeout(timeout, async {
        match protocol {
            Protocol::Tcp => TcpStream::connect(addr).await.map(|_| ()),
            Protocol::Udp => probe_udp(addr).await,
        }
    })
    .await;

    match result {
        Ok(Ok(())) => ProbeResult::Healthy,
        Ok(Err(e)) => {
            debug!(port, %protocol, error = %e, "port probe failed");
            ProbeResult::Unhealthy
        }
        Err(_) => {
            debug!(port, %protocol, "port probe timed out");
            ProbeResult::Unhealthy
        }
    }
}

async fn probe_udp(addr: SocketAddr) -> std::io::Result<()> {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    socket.connect(addr).await?;
    socket.send(&[]).await?;
    let mut buf = [0u8; 1];
    match tokio::time::timeout(UDP_REPLY_WAIT, socket.recv(&mut buf)).await {
        // Silence is not a refusal; most game servers ignore empty datagrams.
        Err(_) | Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e),
    }
}

/// Poll `port` every `interval` after `initial_delay` until it answers or
/// `timeout` elapses.
pub async fn wait_for_port(
    port: u16,
    protocol: Protocol,
    initial_delay: Duration,
    interval: Duration,
    timeout: Duration,
) -> SupervisorResult<()> {
    let deadline = Instant::now() + initial_delay + timeout;
    tokio::time::sleep(initial_delay).await;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if probe_port(port, protocol, interval.min(remaining).max(Duration::from_millis(10))).await
            == ProbeResult::Healthy
        {
            info!(port, %protocol, attempts, "port health check passed");
            return Ok(());
        }
        if Instant::now() + interval >= deadline {
            return Err(SupervisorError::HealthCheck(format!(
                "port {port}/{protocol} not reachable after {}s",
                timeout.as_secs()
            )));
        }
        tokio::time::sleep(interval).await;
    }
}

/// Read stdout lines until one matches `pattern` or `timeout` elapses.
pub async fn wait_for_pattern(
    lines: &mut broadcast::Receiver<String>,
    pattern: &Regex,
    timeout: Duration,
) -> SupervisorResult<()> {
    let scan = async {
        loop {
            match lines.recv().await {
                Ok(line) if pattern.is_match(&line) => return Ok(line),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "log scanner fell behind; lines skipped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(SupervisorError::HealthCheck(
                        "output closed before the log pattern matched".to_string(),
                    ));
                }
            }
        }
    };
    match tokio::time::timeout(timeout, scan).await {
        Ok(Ok(line)) => {
            info!(pattern = %pattern, line = %line, "log pattern health check passed");
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(SupervisorError::HealthCheck(format!(
            "log pattern {:?} not seen within {}s",
            pattern.as_str(),
            timeout.as_secs()
        ))),
    }
}

/// Run the configured startup check. `lines` is only read by `log-pattern`.
pub async fn wait_until_healthy(
    settings: &HealthSettings,
    lines: &mut broadcast::Receiver<String>,
) -> SupervisorResult<()> {
    match settings.kind {
        HealthKind::None => Ok(()),
        HealthKind::Port => {
            let port = settings
                .port
                .ok_or_else(|| SupervisorError::HealthCheck("no health port configured".to_string()))?;
            wait_for_port(
                port,
                settings.protocol,
                settings.initial_delay,
                settings.interval,
                settings.timeout,
            )
            .await
        }
        HealthKind::LogPattern => {
            let pattern = settings.pattern.as_ref().ok_or_else(|| {
                SupervisorError::HealthCheck("no log pattern configured".to_string())
            })?;
            wait_for_pattern(lines, pattern, settings.timeout).await
        }
    }
}

/// Tracks consecutive probe results for the running process.
#[derive(Debug)]
pub struct HealthTracker {
    healthy: bool,
    consecutive_failures: u32,
    unhealthy_threshold: u32,
}

impl HealthTracker {
    pub fn new(unhealthy_threshold: u32) -> Self {
        Self {
            healthy: true,
            consecutive_failures: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
        }
    }

    /// Record a probe result. Returns `true` exactly when this result flips
    /// the tracker from healthy to unhealthy.
    pub fn record(&mut self, result: ProbeResult) -> bool {
        match result {
            ProbeResult::Healthy => {
                if !self.healthy {
                    debug!(failures = self.consecutive_failures, "process recovered to healthy");
                }
                self.consecutive_failures = 0;
                self.healthy = true;
                false
            }
            ProbeResult::Unhealthy => {
                self.consecutive_failures += 1;
                if self.healthy && self.consecutive_failures >= self.unhealthy_threshold {
                    warn!(
                        failures = self.consecutive_failures,
                        threshold = self.unhealthy_threshold,
                        "process marked unhealthy"
                    );
                    self.healthy = false;
                    return true;
                }
                false
            }
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(UNHEALTHY_THRESHOLD)
    }
}

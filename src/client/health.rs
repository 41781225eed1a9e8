//! Active health checks for the local services behind tunnels.

use std::future::Future;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{HealthCheckConfig, HealthCheckKind};

/// Turns a stream of check results into health transitions.
///
/// Starts healthy. Goes unhealthy after `max_failed` consecutive failures and
/// back to healthy on the first success after that.
#[derive(Debug, Clone)]
pub struct FailureCounter {
    max_failed: u32,
    failures: u32,
    healthy: bool,
}

impl FailureCounter {
    pub fn new(max_failed: u32) -> Self {
        Self {
            max_failed: max_failed.max(1),
            failures: 0,
            healthy: true,
        }
    }

    /// Record one check result. Returns the new health when it changed.
    pub fn observe(&mut self, ok: bool) -> Option<bool> {
        if ok {
            self.failures = 0;
            if self.healthy {
                return None;
            }
            self.healthy = true;
            return Some(true);
        }
        self.failures = self.failures.saturating_add(1);
        if self.healthy && self.failures >= self.max_failed {
            self.healthy = false;
            return Some(false);
        }
        None
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }
}

/// Whether a TCP connect to `host:port` succeeds within `timeout`.
pub async fn check_tcp(host: &str, port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

/// Check `host:port` every `interval_secs` until cancelled, calling `report`
/// on every health transition.
pub async fn monitor<F, Fut>(
    config: HealthCheckConfig,
    host: String,
    port: u16,
    cancel: CancellationToken,
    mut report: F,
) where
    F: FnMut(bool) -> Fut + Send,
    Fut: Future<Output = ()> + Send,
{
    let interval = Duration::from_secs(config.interval_secs.max(1));
    let timeout = Duration::from_secs(config.timeout_secs.max(1));
    let mut counter = FailureCounter::new(config.max_failed);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let ok = match config.kind {
            HealthCheckKind::Tcp => check_tcp(&host, port, timeout).await,
        };
        if !ok {
            debug!(host = %host, port, "Health check failed");
        }
        if let Some(healthy) = counter.observe(ok) {
            report(healthy).await;
        }
    }
}

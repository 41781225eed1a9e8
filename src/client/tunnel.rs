//! Client-side tunnel lifecycle.
//!
//! Every configured tunnel runs a small state machine:
//!
//! ```text
//!            tick              resp ok
//!   New ─────────────▶ WaitingForStart ─────────▶ Running
//!    ▲                   │   ▲    │                  │
//!    │        resp error │   │    │ health failed    │ health failed
//!    │                   ▼   │    ▼                  ▼
//!    │            StartError │  CheckFailed ◀────────┘
//!    │                       │
//!    └── tick after 20s wait, 30s cooldown, or healthy again ──┘
//! ```
//!
//! A check worker ticks every 3 seconds and is the only place announcements
//! (`RegisterTunnel`) originate, so at most one is in flight per tunnel.
//! Decisions are made under the tunnel's lock; messages are sent after it is
//! released. A manager lives for one control session; the next session builds
//! a fresh one and thereby re-announces every tunnel.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::health;
use crate::config::{KindConfig, TunnelConfig};
use crate::msg::{CloseTunnel, RegisterTunnel, RegisterTunnelResp, StartWorkConn};
use crate::net::{self, BoxConn};
use crate::session::{Outbox, SessionClosed};

/// Period of the per-tunnel check worker.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(3);

/// How long an announcement may go unanswered before it is repeated.
pub const WAIT_START_TIMEOUT: Duration = Duration::from_secs(20);

/// Cooldown before a refused tunnel is announced again.
pub const START_ERROR_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    New,
    WaitingForStart,
    Running,
    StartError,
    CheckFailed,
    Closed,
}

impl TunnelStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::WaitingForStart => "wait_start",
            Self::Running => "running",
            Self::StartError => "start_error",
            Self::CheckFailed => "check_failed",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct TunnelState {
    pub status: TunnelStatus,
    pub last_error: String,
    pub last_transition: Instant,
    /// Last health-check result; `None` when the tunnel has no health check.
    pub healthy: Option<bool>,
    /// Address the relay reported for the running tunnel.
    pub public_addr: String,
}

impl TunnelState {
    pub fn new(now: Instant, has_health_check: bool) -> Self {
        Self {
            status: TunnelStatus::New,
            last_error: String::new(),
            last_transition: now,
            healthy: has_health_check.then_some(true),
            public_addr: String::new(),
        }
    }

    fn set(&mut self, status: TunnelStatus, now: Instant) {
        self.status = status;
        self.last_transition = now;
    }

    /// Whether the check worker should announce the tunnel at `now`.
    pub fn due_for_announce(&self, now: Instant) -> bool {
        if self.healthy == Some(false) {
            return false;
        }
        let since = now.saturating_duration_since(self.last_transition);
        match self.status {
            TunnelStatus::New | TunnelStatus::CheckFailed => true,
            TunnelStatus::WaitingForStart => since >= WAIT_START_TIMEOUT,
            TunnelStatus::StartError => since >= START_ERROR_COOLDOWN,
            TunnelStatus::Running | TunnelStatus::Closed => false,
        }
    }
}

/// Announcement for a configured tunnel.
pub fn register_msg(config: &TunnelConfig) -> RegisterTunnel {
    let base = &config.base;
    let mut msg = RegisterTunnel {
        tunnel_name: base.name.clone(),
        tunnel_kind: config.kind.kind(),
        use_encryption: base.use_encryption,
        use_compression: base.use_compression,
        ..RegisterTunnel::default()
    };
    match &config.kind {
        KindConfig::Tcp { remote_port } | KindConfig::Udp { remote_port } => {
            msg.remote_port = *remote_port;
        }
        KindConfig::Http {
            custom_domains,
            subdomain,
        }
        | KindConfig::Https {
            custom_domains,
            subdomain,
        } => {
            msg.custom_domains.clone_from(custom_domains);
            msg.subdomain.clone_from(subdomain);
        }
        KindConfig::Stcp { secret_key } | KindConfig::Xtcp { secret_key } => {
            msg.secret_key.clone_from(secret_key);
        }
    }
    msg
}

/// Local end of a running tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalHandler {
    Tcp { ip: String, port: u16 },
}

impl LocalHandler {
    pub fn for_tunnel(config: &TunnelConfig) -> Result<Self, String> {
        match config.kind {
            KindConfig::Tcp { .. } => Ok(Self::Tcp {
                ip: config.base.local_ip.clone(),
                port: config.base.local_port,
            }),
            ref other => Err(format!("no local handler for {} tunnels", other.kind())),
        }
    }

    /// Connect the local service and splice it with `work` until both close.
    pub async fn serve(&self, mut work: BoxConn) -> io::Result<(u64, u64)> {
        match self {
            Self::Tcp { ip, port } => {
                let mut local = TcpStream::connect((ip.as_str(), *port)).await?;
                local.set_nodelay(true)?;
                net::join(&mut work, &mut local).await
            }
        }
    }
}

struct Inner {
    state: TunnelState,
    handler: Option<LocalHandler>,
}

struct Tunnel {
    config: TunnelConfig,
    inner: Mutex<Inner>,
    wake: Notify,
}

impl Tunnel {
    fn new(config: TunnelConfig) -> Self {
        let state = TunnelState::new(Instant::now(), config.base.health_check.is_some());
        Self {
            config,
            inner: Mutex::new(Inner {
                state,
                handler: None,
            }),
            wake: Notify::new(),
        }
    }

    fn name(&self) -> &str {
        self.config.name()
    }

    /// One check-worker step.
    async fn check(&self, outbox: &Outbox) -> Result<(), SessionClosed> {
        let announce = {
            let mut inner = self.inner.lock().await;
            let now = Instant::now();
            let due = inner.state.due_for_announce(now);
            if due {
                inner.state.set(TunnelStatus::WaitingForStart, now);
            }
            due
        };
        if announce {
            debug!(tunnel = %self.name(), "Announcing tunnel");
            outbox.send(register_msg(&self.config)).await?;
        }
        Ok(())
    }

    async fn on_register_resp(&self, resp: &RegisterTunnelResp) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        if inner.state.status != TunnelStatus::WaitingForStart {
            debug!(
                tunnel = %self.name(),
                status = %inner.state.status,
                "Ignoring stale registration response"
            );
            return;
        }
        if !resp.error.is_empty() {
            warn!(tunnel = %self.name(), error = %resp.error, "Relay refused tunnel");
            inner.state.last_error.clone_from(&resp.error);
            inner.state.set(TunnelStatus::StartError, now);
            return;
        }
        match LocalHandler::for_tunnel(&self.config) {
            Ok(handler) => {
                info!(tunnel = %self.name(), public_addr = %resp.public_addr, "Tunnel running");
                inner.handler = Some(handler);
                inner.state.public_addr.clone_from(&resp.public_addr);
                inner.state.last_error.clear();
                inner.state.set(TunnelStatus::Running, now);
            }
            Err(e) => {
                warn!(tunnel = %self.name(), error = %e, "Tunnel failed to start");
                inner.state.last_error = e;
                inner.state.set(TunnelStatus::StartError, now);
            }
        }
    }

    async fn on_health(&self, healthy: bool, outbox: &Outbox) {
        let withdraw = {
            let mut inner = self.inner.lock().await;
            inner.state.healthy = Some(healthy);
            let active = matches!(
                inner.state.status,
                TunnelStatus::Running | TunnelStatus::WaitingForStart
            );
            if !healthy && active {
                inner.handler = None;
                inner.state.last_error = "health check failed".to_string();
                inner.state.set(TunnelStatus::CheckFailed, Instant::now());
            }
            !healthy && active
        };
        if healthy {
            info!(tunnel = %self.name(), "Health check passing");
            self.wake.notify_one();
        } else if withdraw {
            warn!(tunnel = %self.name(), "Health check failed, withdrawing tunnel");
            let _ = outbox
                .send(CloseTunnel {
                    tunnel_name: self.name().to_string(),
                })
                .await;
        }
    }

    async fn on_server_close(&self) {
        let mut inner = self.inner.lock().await;
        if matches!(
            inner.state.status,
            TunnelStatus::Running | TunnelStatus::WaitingForStart
        ) {
            info!(tunnel = %self.name(), "Tunnel closed by relay");
            inner.handler = None;
            inner.state.last_error = "closed by relay".to_string();
            inner.state.set(TunnelStatus::StartError, Instant::now());
        }
    }

    async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.handler = None;
        inner.state.set(TunnelStatus::Closed, Instant::now());
    }

    async fn handler(&self) -> Option<LocalHandler> {
        let inner = self.inner.lock().await;
        match inner.state.status {
            TunnelStatus::Running => inner.handler.clone(),
            _ => None,
        }
    }
}

async fn check_worker(tunnel: Arc<Tunnel>, outbox: Outbox, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(CHECK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            () = tunnel.wake.notified() => {}
        }
        if tunnel.check(&outbox).await.is_err() {
            break;
        }
    }
}

/// The tunnels of one control session.
pub struct TunnelManager {
    tunnels: HashMap<String, Arc<Tunnel>>,
    outbox: Outbox,
    cancel: CancellationToken,
    workers: Mutex<JoinSet<()>>,
}

impl TunnelManager {
    /// `cancel` should be a child of the session's done signal.
    pub fn new(configs: &[TunnelConfig], outbox: Outbox, cancel: CancellationToken) -> Self {
        let tunnels = configs
            .iter()
            .map(|c| (c.name().to_string(), Arc::new(Tunnel::new(c.clone()))))
            .collect();
        Self {
            tunnels,
            outbox,
            cancel,
            workers: Mutex::new(JoinSet::new()),
        }
    }

    /// Start every tunnel's check worker and health monitor.
    pub async fn start(&self) {
        let mut workers = self.workers.lock().await;
        for tunnel in self.tunnels.values() {
            workers.spawn(
                check_worker(Arc::clone(tunnel), self.outbox.clone(), self.cancel.clone())
                    .in_current_span(),
            );

            let Some(check) = tunnel.config.base.health_check.clone() else {
                continue;
            };
            let reporter = Arc::clone(tunnel);
            let outbox = self.outbox.clone();
            workers.spawn(
                health::monitor(
                    check,
                    tunnel.config.base.local_ip.clone(),
                    tunnel.config.base.local_port,
                    self.cancel.clone(),
                    move |healthy| {
                        let tunnel = Arc::clone(&reporter);
                        let outbox = outbox.clone();
                        async move { tunnel.on_health(healthy, &outbox).await }
                    },
                )
                .in_current_span(),
            );
        }
    }

    pub async fn on_register_resp(&self, resp: &RegisterTunnelResp) {
        match self.tunnels.get(&resp.tunnel_name) {
            Some(tunnel) => tunnel.on_register_resp(resp).await,
            None => debug!(tunnel = %resp.tunnel_name, "Response for unknown tunnel"),
        }
    }

    pub async fn on_server_close(&self, name: &str) {
        if let Some(tunnel) = self.tunnels.get(name) {
            tunnel.on_server_close().await;
        }
    }

    /// Feed a health result to a tunnel as if its monitor had reported it.
    pub async fn report_health(&self, name: &str, healthy: bool) {
        if let Some(tunnel) = self.tunnels.get(name) {
            tunnel.on_health(healthy, &self.outbox).await;
        }
    }

    /// Splice a started work connection to its tunnel's local service.
    pub async fn serve_work_conn(&self, work: BoxConn, start: &StartWorkConn) {
        let name = &start.tunnel_name;
        let Some(tunnel) = self.tunnels.get(name) else {
            warn!(tunnel = %name, "Work connection for unknown tunnel");
            return;
        };
        let Some(handler) = tunnel.handler().await else {
            warn!(tunnel = %name, "Work connection for tunnel that is not running");
            return;
        };
        debug!(
            tunnel = %name,
            src = %format_args!("{}:{}", start.src_addr, start.src_port),
            "Serving work connection"
        );
        match handler.serve(work).await {
            Ok((sent, received)) => {
                debug!(tunnel = %name, sent, received, "Work connection finished");
            }
            Err(e) => warn!(tunnel = %name, error = %e, "Local connection failed"),
        }
    }

    pub async fn state(&self, name: &str) -> Option<TunnelState> {
        let tunnel = self.tunnels.get(name)?;
        Some(tunnel.inner.lock().await.state.clone())
    }

    /// Stop every worker and mark every tunnel closed.
    pub async fn close(&self) {
        self.cancel.cancel();
        let mut workers = self.workers.lock().await;
        while workers.join_next().await.is_some() {}
        for tunnel in self.tunnels.values() {
            tunnel.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthCheckConfig;
    use crate::msg::{Message, TunnelKind};
    use tokio::sync::mpsc;

    fn manager(configs: &[TunnelConfig]) -> (TunnelManager, mpsc::Receiver<Message>) {
        let done = CancellationToken::new();
        let (outbox, rx) = Outbox::channel(done.clone());
        (TunnelManager::new(configs, outbox, done.child_token()), rx)
    }

    fn ok_resp(name: &str) -> RegisterTunnelResp {
        RegisterTunnelResp {
            tunnel_name: name.to_string(),
            public_addr: ":9000".to_string(),
            error: String::new(),
        }
    }

    async fn expect_register(rx: &mut mpsc::Receiver<Message>, name: &str) {
        match rx.recv().await {
            Some(Message::RegisterTunnel(reg)) => assert_eq!(reg.tunnel_name, name),
            other => panic!("expected RegisterTunnel, got {other:?}"),
        }
    }

    #[test]
    fn test_register_msg_from_config() {
        let msg = register_msg(&TunnelConfig::tcp("web", 8080, 9000));
        assert_eq!(msg.tunnel_name, "web");
        assert_eq!(msg.tunnel_kind, TunnelKind::Tcp);
        assert_eq!(msg.remote_port, 9000);

        let site = TunnelConfig {
            kind: KindConfig::Http {
                custom_domains: vec!["a.example.com".to_string()],
                subdomain: "a".to_string(),
            },
            ..TunnelConfig::tcp("site", 80, 0)
        };
        let msg = register_msg(&site);
        assert_eq!(msg.tunnel_kind, TunnelKind::Http);
        assert_eq!(msg.custom_domains, vec!["a.example.com".to_string()]);
        assert_eq!(msg.subdomain, "a");
        assert_eq!(msg.remote_port, 0);
    }

    #[test]
    fn test_local_handler_only_for_tcp() {
        let tcp = TunnelConfig::tcp("web", 8080, 0);
        assert_eq!(
            LocalHandler::for_tunnel(&tcp),
            Ok(LocalHandler::Tcp {
                ip: "127.0.0.1".to_string(),
                port: 8080
            })
        );
        let udp = TunnelConfig {
            kind: KindConfig::Udp { remote_port: 53 },
            ..tcp
        };
        assert!(LocalHandler::for_tunnel(&udp).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_due_for_announce_timers() {
        let start = Instant::now();
        let mut state = TunnelState::new(start, false);
        assert!(state.due_for_announce(start));

        state.set(TunnelStatus::WaitingForStart, start);
        assert!(!state.due_for_announce(start + Duration::from_secs(19)));
        assert!(state.due_for_announce(start + WAIT_START_TIMEOUT));

        state.set(TunnelStatus::StartError, start);
        assert!(!state.due_for_announce(start + Duration::from_secs(29)));
        assert!(state.due_for_announce(start + START_ERROR_COOLDOWN));

        state.set(TunnelStatus::Running, start);
        assert!(!state.due_for_announce(start + Duration::from_secs(3600)));
        state.set(TunnelStatus::Closed, start);
        assert!(!state.due_for_announce(start + Duration::from_secs(3600)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_tunnel_is_not_announced() {
        let start = Instant::now();
        let mut state = TunnelState::new(start, true);
        state.set(TunnelStatus::CheckFailed, start);
        state.healthy = Some(false);
        assert!(!state.due_for_announce(start + Duration::from_secs(60)));
        state.healthy = Some(true);
        assert!(state.due_for_announce(start));
    }

    #[tokio::test(start_paused = true)]
    async fn test_announce_then_run() {
        let (mgr, mut rx) = manager(&[TunnelConfig::tcp("web", 8080, 9000)]);
        mgr.start().await;
        expect_register(&mut rx, "web").await;
        assert_eq!(
            mgr.state("web").await.unwrap().status,
            TunnelStatus::WaitingForStart
        );

        mgr.on_register_resp(&ok_resp("web")).await;
        let state = mgr.state("web").await.unwrap();
        assert_eq!(state.status, TunnelStatus::Running);
        assert_eq!(state.public_addr, ":9000");

        // Running tunnels are not announced again.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
        mgr.close().await;
        assert_eq!(mgr.state("web").await.unwrap().status, TunnelStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_announcement_is_repeated() {
        let (mgr, mut rx) = manager(&[TunnelConfig::tcp("web", 8080, 0)]);
        let started = Instant::now();
        mgr.start().await;
        expect_register(&mut rx, "web").await;
        expect_register(&mut rx, "web").await;
        let waited = started.elapsed();
        assert!(waited >= WAIT_START_TIMEOUT, "repeated after {waited:?}");
        assert!(waited < WAIT_START_TIMEOUT + CHECK_INTERVAL + Duration::from_secs(1));
        mgr.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_tunnel_retries_after_cooldown() {
        let (mgr, mut rx) = manager(&[TunnelConfig::tcp("web", 8080, 0)]);
        mgr.start().await;
        expect_register(&mut rx, "web").await;

        let refused_at = Instant::now();
        mgr.on_register_resp(&RegisterTunnelResp {
            tunnel_name: "web".to_string(),
            public_addr: String::new(),
            error: "port 0 is not allowed".to_string(),
        })
        .await;
        let state = mgr.state("web").await.unwrap();
        assert_eq!(state.status, TunnelStatus::StartError);
        assert_eq!(state.last_error, "port 0 is not allowed");

        expect_register(&mut rx, "web").await;
        assert!(refused_at.elapsed() >= START_ERROR_COOLDOWN);
        mgr.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_response_is_ignored() {
        let (mgr, _rx) = manager(&[TunnelConfig::tcp("web", 8080, 0)]);
        // Never announced: still New.
        mgr.on_register_resp(&ok_resp("web")).await;
        assert_eq!(mgr.state("web").await.unwrap().status, TunnelStatus::New);
        mgr.on_register_resp(&ok_resp("missing")).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_failure_withdraws_and_recovery_reannounces() {
        let mut config = TunnelConfig::tcp("web", 8080, 0);
        config.base.health_check = Some(HealthCheckConfig {
            kind: crate::config::HealthCheckKind::Tcp,
            interval_secs: 3600,
            timeout_secs: 1,
            max_failed: 1,
        });
        let (mgr, mut rx) = manager(&[config]);
        mgr.start().await;
        expect_register(&mut rx, "web").await;
        mgr.on_register_resp(&ok_resp("web")).await;

        mgr.report_health("web", false).await;
        match rx.recv().await {
            Some(Message::CloseTunnel(close)) => assert_eq!(close.tunnel_name, "web"),
            other => panic!("expected CloseTunnel, got {other:?}"),
        }
        let state = mgr.state("web").await.unwrap();
        assert_eq!(state.status, TunnelStatus::CheckFailed);
        assert_eq!(state.healthy, Some(false));

        // Still unhealthy: the check worker leaves it alone.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err());

        // Healthy again: the worker re-announces.
        mgr.report_health("web", true).await;
        expect_register(&mut rx, "web").await;
        assert_eq!(
            mgr.state("web").await.unwrap().status,
            TunnelStatus::WaitingForStart
        );
        mgr.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_close_moves_to_start_error() {
        let (mgr, mut rx) = manager(&[TunnelConfig::tcp("web", 8080, 0)]);
        mgr.start().await;
        expect_register(&mut rx, "web").await;
        mgr.on_register_resp(&ok_resp("web")).await;
        mgr.on_server_close("web").await;
        assert_eq!(
            mgr.state("web").await.unwrap().status,
            TunnelStatus::StartError
        );
        mgr.close().await;
    }
}

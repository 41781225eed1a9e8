//! One client's control session on the relay.
//!
//! A [`Control`] is created for every accepted login and lives until its
//! heartbeat times out, its connection fails, a newer login with the same run
//! id replaces it, or the server shuts down. It owns the tunnels the client
//! registered and the pool of idle work connections the client dialed in.
//!
//! Pool and tunnel table sit behind one mutex; nothing holds it across I/O.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::SinkExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::pool::WorkConnPool;
use super::tunnel::{self, RegisterError, ServerTunnel, TunnelSnapshot};
use super::ServerContext;
use crate::auth::unix_now;
use crate::msg::{
    self, Login, LoginResp, Message, MsgCodec, Ping, Pong, RegisterTunnel, RegisterTunnelResp,
    ReqWorkConn, StartWorkConn, PROTOCOL_VERSION,
};
use crate::net::BoxConn;
use crate::session::{
    self, HeartbeatClock, Outbox, SessionClosed, HEARTBEAT_CHECK_INTERVAL, QUEUE_CAPACITY,
};

/// Attempts at handing a user connection a live work connection.
pub const MAX_CLAIM_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Working,
    Closing,
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// A newer login with the same run id took over.
    Replaced,
    HeartbeatTimeout,
    AuthFailed,
    ConnectionLost,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Replaced => "replaced by new login",
            Self::HeartbeatTimeout => "heartbeat timeout",
            Self::AuthFailed => "authentication failed",
            Self::ConnectionLost => "connection lost",
            Self::Shutdown => "server shutdown",
        })
    }
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control session closed")]
    Closed,

    #[error("timed out waiting for a work connection")]
    WorkConnTimeout,

    #[error("no usable work connection after {0} attempts")]
    WorkConnUnavailable(usize),
}

impl From<SessionClosed> for ControlError {
    fn from(_: SessionClosed) -> Self {
        Self::Closed
    }
}

/// Read-only view for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub run_id: String,
    pub user: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub version: String,
    pub login_at: i64,
    pub status: SessionStatus,
    pub pool_target: usize,
    pub pool_capacity: usize,
    pub idle_work_conns: usize,
    pub secs_since_heartbeat: u64,
    pub tunnels: Vec<TunnelSnapshot>,
}

struct Shared {
    pool: WorkConnPool<BoxConn>,
    tunnels: HashMap<String, ServerTunnel>,
}

pub struct Control {
    run_id: String,
    login: Login,
    login_at: i64,
    pool_target: usize,
    ctx: Arc<ServerContext>,
    outbox: Outbox,
    outbox_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    shared: Mutex<Shared>,
    pool_ready: Notify,
    heartbeat: HeartbeatClock,
    done: CancellationToken,
    close_reason: OnceLock<CloseReason>,
    status: watch::Sender<SessionStatus>,
}

impl Control {
    /// Build a session for an authenticated login. Nothing runs until
    /// [`run`](Self::run).
    pub fn new(run_id: String, login: Login, ctx: Arc<ServerContext>) -> Arc<Self> {
        let pool_target = login.pool_count.min(ctx.config.max_pool_count) as usize;
        let done = CancellationToken::new();
        let (outbox, outbox_rx) = Outbox::channel(done.clone());
        let (status, _) = watch::channel(SessionStatus::Working);
        Arc::new(Self {
            run_id,
            login,
            login_at: unix_now(),
            pool_target,
            shared: Mutex::new(Shared {
                pool: WorkConnPool::new(pool_target + ctx.config.pool_slack),
                tunnels: HashMap::new(),
            }),
            ctx,
            outbox,
            outbox_rx: Mutex::new(Some(outbox_rx)),
            pool_ready: Notify::new(),
            heartbeat: HeartbeatClock::new(),
            done,
            close_reason: OnceLock::new(),
            status,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn login(&self) -> &Login {
        &self.login
    }

    pub fn pool_target(&self) -> usize {
        self.pool_target
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Set once the session starts closing.
    pub fn close_reason(&self) -> Option<CloseReason> {
        if self.done.is_cancelled() {
            Some(self.close_reason.get().copied().unwrap_or(CloseReason::ConnectionLost))
        } else {
            None
        }
    }

    /// Ask every duty to stop. The first reason given wins.
    pub fn shutdown(&self, reason: CloseReason) {
        let _ = self.close_reason.set(reason);
        self.done.cancel();
    }

    /// Resolves once teardown has finished.
    pub async fn wait_closed(&self) {
        let mut rx = self.status.subscribe();
        let _ = rx.wait_for(|s| *s == SessionStatus::Closed).await;
    }

    /// Drive the session over its control connection until it ends.
    ///
    /// Sends the `LoginResp`, starts the reader, writer and manager duties,
    /// asks the client for `pool_target` work connections, then waits for the
    /// done signal and tears everything down.
    pub async fn run(self: Arc<Self>, conn: BoxConn) {
        let Some(outbox_rx) = self.outbox_rx.lock().await.take() else {
            warn!("Control session is already running");
            return;
        };
        let max_len = self.ctx.config.max_msg_len;
        let (rd, wr) = tokio::io::split(conn);
        let mut sink = FramedWrite::new(wr, MsgCodec::new(max_len));

        let resp = LoginResp {
            version: PROTOCOL_VERSION.to_string(),
            run_id: self.run_id.clone(),
            error: String::new(),
        };
        if let Err(e) = sink.send(resp.into()).await {
            warn!(error = %e, "Failed to send login response");
            self.shutdown(CloseReason::ConnectionLost);
            self.teardown().await;
            return;
        }
        info!(
            user = %self.login.user,
            hostname = %self.login.hostname,
            version = %self.login.version,
            pool_target = self.pool_target,
            "Client logged in"
        );

        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_CAPACITY);
        let mut duties = JoinSet::new();
        duties.spawn(session::write_loop(sink, outbox_rx, self.done.clone()).in_current_span());
        duties.spawn(
            session::read_loop(
                FramedRead::new(rd, MsgCodec::new(max_len)),
                inbound_tx,
                self.done.clone(),
            )
            .in_current_span(),
        );
        duties.spawn(Arc::clone(&self).manage(inbound_rx).in_current_span());

        for _ in 0..self.pool_target {
            if self.outbox.send(ReqWorkConn {}).await.is_err() {
                break;
            }
        }

        self.done.cancelled().await;
        self.status.send_replace(SessionStatus::Closing);
        while duties.join_next().await.is_some() {}
        self.teardown().await;
    }

    /// Message dispatch and heartbeat deadline.
    async fn manage(self: Arc<Self>, mut inbound: mpsc::Receiver<Message>) {
        let timeout = self.ctx.config.heartbeat_timeout();
        let mut check = tokio::time::interval(HEARTBEAT_CHECK_INTERVAL);
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.done.cancelled() => break,
                _ = check.tick(), if timeout.is_some() => {
                    if timeout.is_some_and(|t| self.heartbeat.is_expired(t)) {
                        warn!(
                            silent_secs = self.heartbeat.elapsed().as_secs(),
                            "Heartbeat timeout"
                        );
                        self.shutdown(CloseReason::HeartbeatTimeout);
                        break;
                    }
                }
                msg = inbound.recv() => match msg {
                    Some(msg) => self.dispatch(msg).await,
                    None => break,
                },
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, msg: Message) {
        self.heartbeat.touch();
        match msg {
            Message::RegisterTunnel(req) => {
                let resp = self.register_tunnel(req).await;
                let _ = self.outbox.send(resp).await;
            }
            Message::CloseTunnel(req) => self.close_tunnel(&req.tunnel_name).await,
            Message::Ping(ping) => self.handle_ping(&ping).await,
            other => warn!(msg = other.name(), "Unexpected message on control connection"),
        }
    }

    async fn handle_ping(&self, ping: &Ping) {
        if let Err(e) = self.ctx.auth.verify_ping(ping, unix_now()) {
            warn!(error = %e, "Heartbeat authentication failed");
            let _ = self
                .outbox
                .send(Pong {
                    error: e.to_string(),
                })
                .await;
            self.shutdown(CloseReason::AuthFailed);
            return;
        }
        let _ = self.outbox.send(Pong::default()).await;
    }

    /// Validate and start a tunnel, producing the reply for the client.
    pub async fn register_tunnel(self: &Arc<Self>, req: RegisterTunnel) -> RegisterTunnelResp {
        match self.start_tunnel(&req).await {
            Ok(public_addr) => {
                info!(
                    tunnel = %req.tunnel_name,
                    kind = %req.tunnel_kind,
                    public_addr = %public_addr,
                    "Tunnel registered"
                );
                RegisterTunnelResp {
                    tunnel_name: req.tunnel_name,
                    public_addr,
                    error: String::new(),
                }
            }
            Err(e) => {
                warn!(tunnel = %req.tunnel_name, error = %e, "Tunnel registration refused");
                RegisterTunnelResp {
                    tunnel_name: req.tunnel_name,
                    public_addr: String::new(),
                    error: e.to_string(),
                }
            }
        }
    }

    async fn start_tunnel(self: &Arc<Self>, req: &RegisterTunnel) -> Result<String, RegisterError> {
        if req.tunnel_name.is_empty() {
            return Err(RegisterError::EmptyName);
        }
        if self.shared.lock().await.tunnels.contains_key(&req.tunnel_name) {
            return Err(RegisterError::AlreadyRegistered(req.tunnel_name.clone()));
        }

        let started = tunnel::start(req, Arc::downgrade(self), &self.ctx, self.done.child_token()).await?;
        let public_addr = started.public_addr().to_string();

        let mut shared = self.shared.lock().await;
        if shared.pool.is_closed() {
            started.stop();
            return Err(RegisterError::SessionClosed);
        }
        shared.tunnels.insert(req.tunnel_name.clone(), started);
        Ok(public_addr)
    }

    /// Stop routing traffic for `name`.
    pub async fn close_tunnel(&self, name: &str) {
        let removed = self.shared.lock().await.tunnels.remove(name);
        match removed {
            Some(tunnel) => {
                tunnel.stop();
                info!(tunnel = %name, "Tunnel closed");
            }
            None => debug!(tunnel = %name, "Close for unknown tunnel"),
        }
    }

    /// Offer an idle work connection to the pool without blocking. A full or
    /// closed pool hands the connection back.
    pub async fn register_work_conn(&self, conn: BoxConn) -> Result<(), BoxConn> {
        let pushed = self.shared.lock().await.pool.try_push(conn);
        if pushed.is_ok() {
            self.pool_ready.notify_one();
        }
        pushed
    }

    /// Claim an idle work connection, asking the client for one if the pool
    /// is empty. Every successful claim queues one `ReqWorkConn` to refill
    /// the pool. Gives up with `WorkConnTimeout` after `timeout`, including
    /// time spent waiting for room in the outbound queue.
    pub async fn get_work_conn(&self, timeout: Duration) -> Result<BoxConn, ControlError> {
        let deadline = Instant::now() + timeout;
        let conn = match self.pop_idle().await? {
            Some(conn) => conn,
            None => {
                tokio::time::timeout_at(deadline, self.outbox.send(ReqWorkConn {}))
                    .await
                    .map_err(|_| ControlError::WorkConnTimeout)??;
                self.wait_for_work_conn(deadline).await?
            }
        };
        match self.outbox.try_send(ReqWorkConn {}) {
            Ok(true) => {}
            Ok(false) => debug!("Control queue full, pool not replenished"),
            Err(SessionClosed) => debug!("Session closing, pool not replenished"),
        }
        Ok(conn)
    }

    /// [`get_work_conn`](Self::get_work_conn), then bind the connection to a
    /// tunnel by writing `StartWorkConn` on it. A connection that fails the
    /// write is discarded and another is claimed.
    pub async fn claim_work_conn(
        &self,
        start: &StartWorkConn,
        timeout: Duration,
    ) -> Result<BoxConn, ControlError> {
        let start = Message::from(start.clone());
        for attempt in 1..=MAX_CLAIM_ATTEMPTS {
            let mut conn = self.get_work_conn(timeout).await?;
            match msg::write_msg(&mut conn, &start).await {
                Ok(()) => return Ok(conn),
                Err(e) => warn!(attempt, error = %e, "Work connection is dead, discarding"),
            }
        }
        Err(ControlError::WorkConnUnavailable(MAX_CLAIM_ATTEMPTS))
    }

    async fn pop_idle(&self) -> Result<Option<BoxConn>, ControlError> {
        let mut shared = self.shared.lock().await;
        if shared.pool.is_closed() || self.done.is_cancelled() {
            return Err(ControlError::Closed);
        }
        Ok(shared.pool.pop())
    }

    async fn wait_for_work_conn(&self, deadline: Instant) -> Result<BoxConn, ControlError> {
        loop {
            let notified = self.pool_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(conn) = self.pop_idle().await? {
                return Ok(conn);
            }
            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep_until(deadline) => return Err(ControlError::WorkConnTimeout),
                () = self.done.cancelled() => return Err(ControlError::Closed),
            }
        }
    }

    pub async fn idle_work_conns(&self) -> usize {
        self.shared.lock().await.pool.len()
    }

    pub async fn tunnel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.lock().await.tunnels.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let shared = self.shared.lock().await;
        let mut tunnels: Vec<TunnelSnapshot> = shared.tunnels.values().map(ServerTunnel::snapshot).collect();
        tunnels.sort_by(|a, b| a.name.cmp(&b.name));
        SessionSnapshot {
            run_id: self.run_id.clone(),
            user: self.login.user.clone(),
            hostname: self.login.hostname.clone(),
            os: self.login.os.clone(),
            arch: self.login.arch.clone(),
            version: self.login.version.clone(),
            login_at: self.login_at,
            status: self.status(),
            pool_target: self.pool_target,
            pool_capacity: shared.pool.capacity(),
            idle_work_conns: shared.pool.len(),
            secs_since_heartbeat: self.heartbeat.elapsed().as_secs(),
            tunnels,
        }
    }

    /// Withdraw tunnels, drop idle work connections, leave the registry.
    async fn teardown(self: &Arc<Self>) {
        let (idle, tunnels) = {
            let mut shared = self.shared.lock().await;
            let idle = shared.pool.close();
            let tunnels: Vec<ServerTunnel> = shared.tunnels.drain().map(|(_, t)| t).collect();
            (idle, tunnels)
        };
        for tunnel in &tunnels {
            tunnel.stop();
        }
        let deregistered = self.ctx.registry.remove_if_same(&self.run_id, self).await;
        self.status.send_replace(SessionStatus::Closed);
        info!(
            reason = %self.close_reason().unwrap_or(CloseReason::ConnectionLost),
            tunnels = tunnels.len(),
            idle_work_conns = idle.len(),
            deregistered,
            "Control session closed"
        );
    }
}

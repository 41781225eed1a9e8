//! One logged-in control session on the client.
//!
//! Runs the reader and writer from [`crate::session`], a manager that sends
//! pings and checks for pongs, and the [`TunnelManager`] for this session.
//! `ReqWorkConn` from the relay spawns a task that dials a work connection,
//! announces it with `NewWorkConn`, and waits for `StartWorkConn` before
//! splicing it to the named tunnel.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::tunnel::TunnelManager;
use super::ClientError;
use crate::auth::Authenticator;
use crate::config::{ClientConfig, TunnelConfig};
use crate::msg::{self, Message, MsgCodec, NewWorkConn, Ping, StartWorkConn};
use crate::net::{BoxConn, Connector};
use crate::session::{self, HeartbeatClock, Outbox, HEARTBEAT_CHECK_INTERVAL, QUEUE_CAPACITY};

pub struct Control<C> {
    run_id: String,
    config: ClientConfig,
    auth: Authenticator,
    connector: Arc<C>,
    max_msg_len: u64,
    outbox: Outbox,
    outbox_rx: std::sync::Mutex<Option<mpsc::Receiver<Message>>>,
    tunnels: TunnelManager,
    last_pong: HeartbeatClock,
    done: CancellationToken,
}

impl<C: Connector> Control<C> {
    /// `done` ends the session; pass a child of the client's shutdown token.
    pub fn new(
        run_id: String,
        config: ClientConfig,
        auth: Authenticator,
        tunnels: &[TunnelConfig],
        connector: Arc<C>,
        max_msg_len: u64,
        done: CancellationToken,
    ) -> Arc<Self> {
        let (outbox, outbox_rx) = Outbox::channel(done.clone());
        let tunnels = TunnelManager::new(tunnels, outbox.clone(), done.child_token());
        Arc::new(Self {
            run_id,
            config,
            auth,
            connector,
            max_msg_len,
            outbox,
            outbox_rx: std::sync::Mutex::new(Some(outbox_rx)),
            tunnels,
            last_pong: HeartbeatClock::new(),
            done,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn tunnels(&self) -> &TunnelManager {
        &self.tunnels
    }

    pub fn close(&self) {
        self.done.cancel();
    }

    /// Drive the session over an already logged-in control connection.
    /// Returns when the connection dies or `done` is cancelled.
    pub async fn run(self: Arc<Self>, conn: BoxConn) {
        let outbox_rx = self
            .outbox_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let Some(outbox_rx) = outbox_rx else {
            warn!("Control session is already running");
            return;
        };
        let (rd, wr) = tokio::io::split(conn);
        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_CAPACITY);

        let mut duties = JoinSet::new();
        duties.spawn(
            session::write_loop(
                FramedWrite::new(wr, MsgCodec::new(self.max_msg_len)),
                outbox_rx,
                self.done.clone(),
            )
            .in_current_span(),
        );
        duties.spawn(
            session::read_loop(
                FramedRead::new(rd, MsgCodec::new(self.max_msg_len)),
                inbound_tx,
                self.done.clone(),
            )
            .in_current_span(),
        );
        duties.spawn(Arc::clone(&self).manage(inbound_rx).in_current_span());
        self.tunnels.start().await;

        self.done.cancelled().await;
        while duties.join_next().await.is_some() {}
        self.tunnels.close().await;
        info!("Control session ended");
    }

    async fn manage(self: Arc<Self>, mut inbound: mpsc::Receiver<Message>) {
        let heartbeat_interval = self.config.heartbeat_interval();
        let heartbeat_timeout = self.config.heartbeat_timeout();
        let mut ping = heartbeat_interval.map(|period| {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        let mut check = tokio::time::interval(HEARTBEAT_CHECK_INTERVAL);
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut work_conns = JoinSet::new();

        loop {
            tokio::select! {
                () = self.done.cancelled() => break,
                () = tick(&mut ping) => {
                    let mut msg = Ping::default();
                    self.auth.sign_ping(&mut msg);
                    if self.outbox.send(msg).await.is_err() {
                        break;
                    }
                }
                _ = check.tick(), if heartbeat_interval.is_some() => {
                    if self.last_pong.is_expired(heartbeat_timeout) {
                        warn!(
                            silent_secs = self.last_pong.elapsed().as_secs(),
                            "Heartbeat timeout, control connection is dead"
                        );
                        break;
                    }
                }
                Some(_) = work_conns.join_next(), if !work_conns.is_empty() => {}
                msg = inbound.recv() => match msg {
                    Some(msg) => self.dispatch(msg, &mut work_conns).await,
                    None => break,
                },
            }
        }
        self.done.cancel();
        work_conns.shutdown().await;
    }

    async fn dispatch(self: &Arc<Self>, msg: Message, work_conns: &mut JoinSet<()>) {
        match msg {
            Message::ReqWorkConn(_) => {
                work_conns.spawn(Arc::clone(self).handle_work_conn().in_current_span());
            }
            Message::RegisterTunnelResp(resp) => self.tunnels.on_register_resp(&resp).await,
            Message::CloseTunnel(req) => self.tunnels.on_server_close(&req.tunnel_name).await,
            Message::Pong(pong) if !pong.error.is_empty() => {
                warn!(error = %pong.error, "Relay rejected heartbeat");
                self.done.cancel();
            }
            Message::Pong(_) => self.last_pong.touch(),
            other => warn!(msg = other.name(), "Unexpected message on control connection"),
        }
    }

    /// Dial, announce and wait for a work connection, then serve it.
    ///
    /// Waiting is tied to the session; once `StartWorkConn` arrives the
    /// connection is spliced on its own task and outlives the session.
    async fn handle_work_conn(self: Arc<Self>) {
        let opened = tokio::select! {
            () = self.done.cancelled() => return,
            res = self.open_work_conn() => res,
        };
        match opened {
            Ok((conn, start)) => {
                let session = Arc::clone(&self);
                tokio::spawn(
                    async move { session.tunnels.serve_work_conn(conn, &start).await }
                        .in_current_span(),
                );
            }
            Err(e) => warn!(error = %e, "Work connection failed"),
        }
    }

    async fn open_work_conn(&self) -> Result<(BoxConn, StartWorkConn), ClientError> {
        let mut conn = self.connector.connect().await.map_err(ClientError::Connect)?;
        let mut req = NewWorkConn {
            run_id: self.run_id.clone(),
            ..NewWorkConn::default()
        };
        self.auth.sign_new_work_conn(&mut req);
        msg::write_msg(&mut conn, &req.into()).await?;
        debug!("Work connection offered");

        match msg::read_msg(&mut conn, self.max_msg_len).await? {
            Message::StartWorkConn(start) if !start.error.is_empty() => {
                Err(ClientError::WorkConnRejected(start.error))
            }
            Message::StartWorkConn(start) => Ok((conn, start)),
            other => Err(ClientError::Unexpected(other.name())),
        }
    }
}

/// Next tick of an optional interval; pending forever when there is none.
async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

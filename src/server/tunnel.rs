//! Public side of registered tunnels.
//!
//! Only `tcp` has a data plane here: a public listener whose every accepted
//! user connection claims a work connection from the owning session and is
//! spliced onto it. Other kinds are refused at registration.

use std::io;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::sync::Weak;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

use super::control::Control;
use super::ServerContext;
use crate::config::parse_port_ranges;
use crate::msg::{RegisterTunnel, StartWorkConn, TunnelKind};
use crate::net;

/// Ports tried when a tunnel asks for any port under a restricted policy.
const MAX_PORT_ATTEMPTS: usize = 64;

const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("tunnel name must not be empty")]
    EmptyName,

    #[error("tunnel '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("tunnel kind '{0}' is not supported by this server")]
    UnsupportedKind(TunnelKind),

    #[error("port {0} is not allowed")]
    PortNotAllowed(u16),

    #[error("no allowed port is free")]
    NoFreePort,

    #[error("failed to listen on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("control session closed")]
    SessionClosed,
}

/// Public ports tunnels may listen on. No ranges means any port.
#[derive(Debug, Clone, Default)]
pub struct PortPolicy {
    ranges: Vec<RangeInclusive<u16>>,
}

impl PortPolicy {
    pub fn new(ranges: Vec<RangeInclusive<u16>>) -> Self {
        Self { ranges }
    }

    /// Parse an `allow_ports` string such as `"2000-3000,3001"`.
    pub fn parse(list: &str) -> Result<Self, String> {
        parse_port_ranges(list).map(Self::new)
    }

    pub fn is_unrestricted(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn allows(&self, port: u16) -> bool {
        self.is_unrestricted() || self.ranges.iter().any(|r| r.contains(&port))
    }

    fn candidates(&self) -> impl Iterator<Item = u16> + '_ {
        self.ranges
            .iter()
            .flat_map(Clone::clone)
            .filter(|p| *p != 0)
            .take(MAX_PORT_ATTEMPTS)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TunnelSnapshot {
    pub name: String,
    pub kind: TunnelKind,
    pub public_addr: String,
}

/// A running public listener. Dropping it stops the listener and every user
/// connection it is serving.
#[derive(Debug)]
pub struct ServerTunnel {
    name: String,
    kind: TunnelKind,
    public_addr: String,
    cancel: CancellationToken,
}

impl ServerTunnel {
    /// Address reported to the client, `":<port>"`.
    pub fn public_addr(&self) -> &str {
        &self.public_addr
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn snapshot(&self) -> TunnelSnapshot {
        TunnelSnapshot {
            name: self.name.clone(),
            kind: self.kind,
            public_addr: self.public_addr.clone(),
        }
    }
}

impl Drop for ServerTunnel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Start the data plane for `req`. `cancel` should be a child of the owning
/// session's done signal.
pub async fn start(
    req: &RegisterTunnel,
    ctl: Weak<Control>,
    ctx: &ServerContext,
    cancel: CancellationToken,
) -> Result<ServerTunnel, RegisterError> {
    match req.tunnel_kind {
        TunnelKind::Tcp => start_tcp(req, ctl, ctx, cancel).await,
        other => Err(RegisterError::UnsupportedKind(other)),
    }
}

async fn start_tcp(
    req: &RegisterTunnel,
    ctl: Weak<Control>,
    ctx: &ServerContext,
    cancel: CancellationToken,
) -> Result<ServerTunnel, RegisterError> {
    let listener = bind_public(&ctx.config.proxy_bind_addr, req.remote_port, &ctx.policy).await?;
    let local_addr = listener.local_addr().map_err(|source| RegisterError::Bind {
        port: req.remote_port,
        source,
    })?;

    tokio::spawn(
        accept_loop(
            listener,
            req.tunnel_name.clone(),
            ctl,
            ctx.config.user_conn_timeout(),
            cancel.clone(),
        )
        .in_current_span(),
    );

    Ok(ServerTunnel {
        name: req.tunnel_name.clone(),
        kind: TunnelKind::Tcp,
        public_addr: format!(":{}", local_addr.port()),
        cancel,
    })
}

/// Bind `port` on `host`. Port 0 lets the OS pick, or under a restricted
/// policy takes the first free allowed port.
async fn bind_public(host: &str, port: u16, policy: &PortPolicy) -> Result<TcpListener, RegisterError> {
    if port == 0 && !policy.is_unrestricted() {
        for candidate in policy.candidates() {
            if let Ok(listener) = TcpListener::bind((host, candidate)).await {
                return Ok(listener);
            }
        }
        return Err(RegisterError::NoFreePort);
    }
    if !policy.allows(port) {
        return Err(RegisterError::PortNotAllowed(port));
    }
    TcpListener::bind((host, port))
        .await
        .map_err(|source| RegisterError::Bind { port, source })
}

async fn accept_loop(
    listener: TcpListener,
    name: String,
    ctl: Weak<Control>,
    timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            () = cancel.cancelled() => break,
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(tunnel = %name, error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                    continue;
                }
            },
        };
        debug!(tunnel = %name, peer = %peer, "User connection");

        let serve = serve_user_conn(stream, peer, name.clone(), ctl.clone(), timeout);
        let cancel = cancel.clone();
        tokio::spawn(
            async move {
                tokio::select! {
                    () = cancel.cancelled() => {}
                    () = serve => {}
                }
            }
            .in_current_span(),
        );
    }
    debug!(tunnel = %name, "Tunnel listener stopped");
}

async fn serve_user_conn(
    mut user: TcpStream,
    peer: SocketAddr,
    name: String,
    ctl: Weak<Control>,
    timeout: Duration,
) {
    let Some(control) = ctl.upgrade() else {
        return;
    };
    let local = user.local_addr().ok();
    let start = StartWorkConn {
        tunnel_name: name.clone(),
        src_addr: peer.ip().to_string(),
        src_port: peer.port(),
        dst_addr: local.map(|a| a.ip().to_string()).unwrap_or_default(),
        dst_port: local.map_or(0, |a| a.port()),
        error: String::new(),
    };
    let claimed = control.claim_work_conn(&start, timeout).await;
    drop(control);

    let mut work = match claimed {
        Ok(conn) => conn,
        Err(e) => {
            warn!(tunnel = %name, peer = %peer, error = %e, "Dropping user connection");
            return;
        }
    };
    match net::join(&mut user, &mut work).await {
        Ok((sent, received)) => {
            debug!(tunnel = %name, peer = %peer, sent, received, "User connection finished");
        }
        Err(e) => debug!(tunnel = %name, peer = %peer, error = %e, "User connection ended"),
    }
}

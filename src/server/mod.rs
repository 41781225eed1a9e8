//! Relay side: accepts control and work connections from clients.
//!
//! Every physical connection starts with one message. `Login` opens (or
//! replaces) a control session; `NewWorkConn` offers an idle work connection
//! to an existing session's pool. Anything else is dropped.

pub mod control;
pub mod pool;
pub mod registry;
pub mod status;
pub mod tunnel;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use control::{CloseReason, Control, ControlError, SessionSnapshot, SessionStatus};
pub use registry::ControlRegistry;
pub use tunnel::{PortPolicy, RegisterError};

use crate::auth::{unix_now, Authenticator};
use crate::config::{Config, ServerConfig};
use crate::msg::{self, Login, LoginResp, Message, NewWorkConn, StartWorkConn, PROTOCOL_VERSION};
use crate::net::BoxConn;

/// How long a fresh connection may take to send its first message.
pub const FIRST_MSG_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a new login waits for the session it replaces to finish closing.
pub const REPLACE_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid server configuration: {0}")]
    Config(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Everything a session needs from the server, built once and shared.
pub struct ServerContext {
    pub config: ServerConfig,
    pub auth: Authenticator,
    pub policy: PortPolicy,
    pub registry: ControlRegistry,
    pub started_at: Instant,
}

impl ServerContext {
    pub fn new(config: ServerConfig, auth: Authenticator) -> Result<Self, ServerError> {
        let policy = PortPolicy::parse(&config.allow_ports).map_err(ServerError::Config)?;
        Ok(Self {
            config,
            auth,
            policy,
            registry: ControlRegistry::new(),
            started_at: Instant::now(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ServerError> {
        Self::new(config.server.clone(), Authenticator::from_config(&config.auth))
    }
}

/// A bound relay, ready to [`run`](Self::run).
pub struct Server {
    ctx: Arc<ServerContext>,
    listener: TcpListener,
}

impl Server {
    pub async fn bind(config: &Config) -> Result<Self, ServerError> {
        let ctx = ServerContext::from_config(config)?;
        let listener = TcpListener::bind(&ctx.config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: ctx.config.bind_addr.clone(),
                source,
            })?;
        Ok(Self {
            ctx: Arc::new(ctx),
            listener,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub fn context(&self) -> Arc<ServerContext> {
        Arc::clone(&self.ctx)
    }

    /// Accept connections until `shutdown` fires, then close every session.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(addr = ?self.listener.local_addr().ok(), "Relay listening");
        loop {
            let (stream, peer) = tokio::select! {
                () = shutdown.cancelled() => break,
                res = self.listener.accept() => match res {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
            }
            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(handle_connection(ctx, Box::new(stream), peer.to_string()));
        }

        let sessions = self.ctx.registry.all().await;
        info!(sessions = sessions.len(), "Relay shutting down");
        for ctl in &sessions {
            ctl.shutdown(CloseReason::Shutdown);
        }
        for ctl in &sessions {
            ctl.wait_closed().await;
        }
    }
}

/// Route a freshly accepted connection by its first message.
pub async fn handle_connection(ctx: Arc<ServerContext>, mut conn: BoxConn, peer: String) {
    let first = tokio::time::timeout(
        FIRST_MSG_TIMEOUT,
        msg::read_msg(&mut conn, ctx.config.max_msg_len),
    )
    .await;
    let first = match first {
        Ok(Ok(msg)) => msg,
        Ok(Err(e)) => {
            warn!(peer = %peer, error = %e, "Failed to read first message");
            return;
        }
        Err(_) => {
            warn!(peer = %peer, "Timed out waiting for first message");
            return;
        }
    };

    match first {
        Message::Login(login) => handle_login(ctx, conn, login, &peer).await,
        Message::NewWorkConn(req) => handle_work_conn(&ctx, conn, &req, &peer).await,
        other => warn!(peer = %peer, msg = other.name(), "Unexpected first message, closing"),
    }
}

async fn handle_login(ctx: Arc<ServerContext>, mut conn: BoxConn, login: Login, peer: &str) {
    if let Err(e) = ctx.auth.verify_login(&login, unix_now()) {
        warn!(peer = %peer, user = %login.user, error = %e, "Login rejected");
        let resp = LoginResp {
            version: PROTOCOL_VERSION.to_string(),
            run_id: String::new(),
            error: e.to_string(),
        };
        if let Err(e) = msg::write_msg(&mut conn, &resp.into()).await {
            debug!(peer = %peer, error = %e, "Failed to send login rejection");
        }
        return;
    }

    let run_id = if login.run_id.is_empty() {
        new_run_id()
    } else {
        login.run_id.clone()
    };
    let span = info_span!("control", run_id = %run_id);

    async move {
        let ctl = Control::new(run_id, login, Arc::clone(&ctx));
        if let Some(old) = ctx.registry.insert(Arc::clone(&ctl)).await {
            info!(peer = %peer, "Replacing existing session");
            old.shutdown(CloseReason::Replaced);
            if tokio::time::timeout(REPLACE_WAIT, old.wait_closed()).await.is_err() {
                warn!("Replaced session is slow to close, continuing");
            }
        }
        ctl.run(conn).await;
    }
    .instrument(span)
    .await;
}

async fn handle_work_conn(ctx: &ServerContext, mut conn: BoxConn, req: &NewWorkConn, peer: &str) {
    if let Err(e) = ctx.auth.verify_new_work_conn(req, unix_now()) {
        warn!(peer = %peer, run_id = %req.run_id, error = %e, "Work connection rejected");
        let resp = StartWorkConn {
            error: e.to_string(),
            ..StartWorkConn::default()
        };
        if let Err(e) = msg::write_msg(&mut conn, &resp.into()).await {
            debug!(peer = %peer, error = %e, "Failed to send work connection rejection");
        }
        return;
    }
    let Some(ctl) = ctx.registry.get(&req.run_id).await else {
        warn!(peer = %peer, run_id = %req.run_id, "No session for work connection");
        return;
    };
    if ctl.register_work_conn(conn).await.is_err() {
        debug!(run_id = %req.run_id, "Work connection pool full, closing");
    }
}

/// Opaque session id: 16 random bytes, hex.
fn new_run_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthScope;
    use crate::msg::{read_msg, write_msg, Ping, DEFAULT_MAX_MSG_LEN};
    use tokio::io::DuplexStream;

    fn context(auth: Authenticator) -> Arc<ServerContext> {
        let config = ServerConfig {
            proxy_bind_addr: "127.0.0.1".to_string(),
            ..ServerConfig::default()
        };
        Arc::new(ServerContext::new(config, auth).unwrap())
    }

    fn login(auth: &Authenticator, run_id: &str) -> Login {
        let mut login = Login {
            version: PROTOCOL_VERSION.to_string(),
            run_id: run_id.to_string(),
            ..Login::default()
        };
        auth.sign_login(&mut login);
        login
    }

    /// Connect a client over a duplex pipe and send `first`.
    async fn connect(ctx: &Arc<ServerContext>, first: Message) -> DuplexStream {
        let (server_io, mut client_io) = tokio::io::duplex(64 * 1024);
        tokio::spawn(handle_connection(
            Arc::clone(ctx),
            Box::new(server_io),
            "test".to_string(),
        ));
        write_msg(&mut client_io, &first).await.unwrap();
        client_io
    }

    async fn login_resp(client_io: &mut DuplexStream) -> LoginResp {
        match read_msg(client_io, DEFAULT_MAX_MSG_LEN).await.unwrap() {
            Message::LoginResp(resp) => resp,
            other => panic!("expected LoginResp, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_login_mints_run_id() {
        let auth = Authenticator::new("secret", vec![], 900);
        let ctx = context(auth.clone());
        let mut client = connect(&ctx, login(&auth, "").into()).await;
        let resp = login_resp(&mut client).await;
        assert!(resp.error.is_empty());
        assert_eq!(resp.run_id.len(), 32);
        assert!(ctx.registry.get(&resp.run_id).await.is_some());
    }

    #[tokio::test]
    async fn test_login_with_wrong_token_gets_error() {
        let ctx = context(Authenticator::new("secret", vec![], 900));
        let client_auth = Authenticator::new("guess", vec![], 900);
        let mut client = connect(&ctx, login(&client_auth, "").into()).await;
        let resp = login_resp(&mut client).await;
        assert_eq!(resp.error, "authorization failed");
        assert!(resp.run_id.is_empty());
        assert!(ctx.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_relogin_replaces_session() {
        let auth = Authenticator::new("secret", vec![], 900);
        let ctx = context(auth.clone());

        let mut first = connect(&ctx, login(&auth, "run-a").into()).await;
        assert_eq!(login_resp(&mut first).await.run_id, "run-a");
        let old = ctx.registry.get("run-a").await.unwrap();

        let mut second = connect(&ctx, login(&auth, "run-a").into()).await;
        assert_eq!(login_resp(&mut second).await.run_id, "run-a");

        // The old session was fully closed before the new one answered.
        assert_eq!(old.status(), SessionStatus::Closed);
        assert_eq!(old.close_reason(), Some(CloseReason::Replaced));
        assert_eq!(ctx.registry.len().await, 1);
        let current = ctx.registry.get("run-a").await.unwrap();
        assert!(!Arc::ptr_eq(&old, &current));
        assert_eq!(current.status(), SessionStatus::Working);

        // The old control connection is closed; the new one still answers.
        assert!(read_msg(&mut first, DEFAULT_MAX_MSG_LEN).await.is_err());
        write_msg(&mut second, &Ping::default().into()).await.unwrap();
        assert!(matches!(
            read_msg(&mut second, DEFAULT_MAX_MSG_LEN).await.unwrap(),
            Message::Pong(_)
        ));
    }

    #[tokio::test]
    async fn test_work_conn_joins_session_pool() {
        let auth = Authenticator::new("secret", vec![], 900);
        let ctx = context(auth.clone());
        let mut control = connect(&ctx, login(&auth, "run-w").into()).await;
        login_resp(&mut control).await;
        let ctl = ctx.registry.get("run-w").await.unwrap();

        let _work = connect(
            &ctx,
            NewWorkConn {
                run_id: "run-w".to_string(),
                ..NewWorkConn::default()
            }
            .into(),
        )
        .await;
        for _ in 0..100 {
            if ctl.idle_work_conns().await == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(ctl.idle_work_conns().await, 1);
    }

    #[tokio::test]
    async fn test_work_conn_for_unknown_session_is_closed() {
        let ctx = context(Authenticator::new("secret", vec![], 900));
        let mut work = connect(
            &ctx,
            NewWorkConn {
                run_id: "nobody".to_string(),
                ..NewWorkConn::default()
            }
            .into(),
        )
        .await;
        assert!(read_msg(&mut work, DEFAULT_MAX_MSG_LEN).await.unwrap_err().is_eof());
    }

    #[tokio::test]
    async fn test_unsigned_work_conn_rejected_with_scope() {
        let auth = Authenticator::new("secret", vec![AuthScope::NewWorkConns], 900);
        let ctx = context(auth);
        let mut work = connect(
            &ctx,
            NewWorkConn {
                run_id: "any".to_string(),
                ..NewWorkConn::default()
            }
            .into(),
        )
        .await;
        match read_msg(&mut work, DEFAULT_MAX_MSG_LEN).await.unwrap() {
            Message::StartWorkConn(start) => assert!(!start.error.is_empty()),
            other => panic!("expected StartWorkConn, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unexpected_first_message_closes() {
        let ctx = context(Authenticator::new("secret", vec![], 900));
        let mut conn = connect(&ctx, Ping::default().into()).await;
        assert!(read_msg(&mut conn, DEFAULT_MAX_MSG_LEN).await.unwrap_err().is_eof());
    }

    #[test]
    fn test_run_ids_are_unique() {
        assert_ne!(new_run_id(), new_run_id());
    }
}

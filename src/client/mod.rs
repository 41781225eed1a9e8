//! Private-network side: logs in to the relay and keeps tunnels announced.
//!
//! The client cycles `LoggingIn → Active → Reconnecting → Active → …` until
//! shut down. The run id the relay assigns on the first login is sent on
//! every later login so the relay replaces the old session instead of
//! creating a second one.

pub mod control;
pub mod health;
pub mod tunnel;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

pub use control::Control;
pub use tunnel::{LocalHandler, TunnelManager, TunnelState, TunnelStatus};

use crate::auth::Authenticator;
use crate::backoff::Backoff;
use crate::config::{ClientConfig, Config, TunnelConfig};
use crate::msg::{self, CodecError, Login, Message, DEFAULT_MAX_MSG_LEN, PROTOCOL_VERSION};
use crate::net::{BoxConn, Connector, TcpConnector};

/// How long to wait for `LoginResp` after sending `Login`.
pub const LOGIN_RESP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to relay: {0}")]
    Connect(#[source] io::Error),

    #[error("control protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("login rejected by relay: {0}")]
    AuthRejected(String),

    #[error("work connection rejected by relay: {0}")]
    WorkConnRejected(String),

    #[error("unexpected {0} from relay")]
    Unexpected(&'static str),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

/// A configured client, ready to [`run`](Self::run).
pub struct Client<C = TcpConnector> {
    config: ClientConfig,
    auth: Authenticator,
    tunnels: Vec<TunnelConfig>,
    connector: Arc<C>,
    max_msg_len: u64,
}

impl Client<TcpConnector> {
    pub fn from_config(config: &Config) -> Self {
        let connector = TcpConnector::new(config.client.server_addr.clone(), config.client.dial_timeout());
        Self::new(
            config.client.clone(),
            Authenticator::from_config(&config.auth),
            config.tunnels.clone(),
            connector,
        )
    }
}

impl<C: Connector> Client<C> {
    pub fn new(
        config: ClientConfig,
        auth: Authenticator,
        tunnels: Vec<TunnelConfig>,
        connector: C,
    ) -> Self {
        Self {
            config,
            auth,
            tunnels,
            connector: Arc::new(connector),
            max_msg_len: DEFAULT_MAX_MSG_LEN,
        }
    }

    /// Dial the relay and log in, resuming `run_id` if non-empty.
    /// Returns the control connection and the run id the relay assigned.
    pub async fn login(&self, run_id: &str) -> Result<(BoxConn, String), ClientError> {
        self.connector.open().await.map_err(ClientError::Connect)?;
        let mut conn = self.connector.connect().await.map_err(ClientError::Connect)?;

        let mut login = Login {
            version: PROTOCOL_VERSION.to_string(),
            hostname: local_hostname(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            user: self.config.user.clone(),
            run_id: run_id.to_string(),
            pool_count: self.config.pool_count,
            ..Login::default()
        };
        self.auth.sign_login(&mut login);
        msg::write_msg(&mut conn, &login.into()).await?;

        let resp = tokio::time::timeout(LOGIN_RESP_TIMEOUT, msg::read_msg(&mut conn, self.max_msg_len))
            .await
            .map_err(|_| ClientError::Timeout("login response"))??;
        match resp {
            Message::LoginResp(resp) if !resp.error.is_empty() => {
                Err(ClientError::AuthRejected(resp.error))
            }
            Message::LoginResp(resp) => {
                if !msg::is_compatible(&resp.version) {
                    warn!(relay_version = %resp.version, "Relay version may be incompatible");
                }
                Ok((conn, resp.run_id))
            }
            other => Err(ClientError::Unexpected(other.name())),
        }
    }

    /// Log in and serve sessions until `shutdown` fires.
    ///
    /// A failed first login is returned as an error when `login_fail_exit` is
    /// set. Every other failure is retried with exponential backoff.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ClientError> {
        let mut backoff = Backoff::default();
        let mut run_id = String::new();
        let mut first_attempt = true;

        loop {
            let attempt = tokio::select! {
                () = shutdown.cancelled() => return Ok(()),
                res = self.login(&run_id) => res,
            };
            match attempt {
                Ok((conn, assigned)) => {
                    backoff.reset();
                    first_attempt = false;
                    run_id = assigned;
                    info!(run_id = %run_id, server = %self.config.server_addr, "Logged in to relay");

                    let session = Control::new(
                        run_id.clone(),
                        self.config.clone(),
                        self.auth.clone(),
                        &self.tunnels,
                        Arc::clone(&self.connector),
                        self.max_msg_len,
                        shutdown.child_token(),
                    );
                    session
                        .run(conn)
                        .instrument(info_span!("control", run_id = %run_id))
                        .await;
                    self.connector.close().await;
                    if shutdown.is_cancelled() {
                        return Ok(());
                    }
                    warn!(run_id = %run_id, "Control connection lost, reconnecting");
                }
                Err(e) if first_attempt && self.config.login_fail_exit => {
                    self.connector.close().await;
                    return Err(e);
                }
                Err(e) => {
                    self.connector.close().await;
                    warn!(error = %e, "Login failed");
                }
            }

            let delay = backoff.next_delay();
            info!(delay_secs = delay.as_secs(), "Reconnecting after delay");
            tokio::select! {
                () = shutdown.cancelled() => return Ok(()),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Kernel hostname, then `$HOSTNAME`, else empty.
fn local_hostname() -> String {
    let from_proc = std::fs::read_to_string("/proc/sys/kernel/hostname").unwrap_or_default();
    let from_proc = from_proc.trim();
    if !from_proc.is_empty() {
        return from_proc.to_string();
    }
    std::env::var("HOSTNAME")
        .map(|h| h.trim().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{read_msg, write_msg, LoginResp};
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    struct PipeConnector {
        peers: mpsc::UnboundedSender<DuplexStream>,
    }

    impl Connector for PipeConnector {
        async fn open(&self) -> io::Result<()> {
            Ok(())
        }

        async fn connect(&self) -> io::Result<BoxConn> {
            let (near, far) = tokio::io::duplex(64 * 1024);
            self.peers
                .send(far)
                .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "relay gone"))?;
            Ok(Box::new(near))
        }

        async fn close(&self) {}
    }

    fn client(tunnels: Vec<TunnelConfig>) -> (Client<PipeConnector>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (peers, peer_rx) = mpsc::unbounded_channel();
        let client = Client::new(
            ClientConfig::default(),
            Authenticator::new("secret", vec![], 900),
            tunnels,
            PipeConnector { peers },
        );
        (client, peer_rx)
    }

    async fn read_login(relay: &mut DuplexStream) -> Login {
        match read_msg(relay, DEFAULT_MAX_MSG_LEN).await.unwrap() {
            Message::Login(login) => login,
            other => panic!("expected Login, got {other:?}"),
        }
    }

    async fn accept(relay: &mut DuplexStream, run_id: &str) {
        let resp = LoginResp {
            version: PROTOCOL_VERSION.to_string(),
            run_id: run_id.to_string(),
            error: String::new(),
        };
        write_msg(relay, &resp.into()).await.unwrap();
    }

    #[tokio::test]
    async fn test_login_sends_signed_login() {
        let (client, mut peers) = client(vec![]);
        let relay = tokio::spawn(async move {
            let mut conn = peers.recv().await.unwrap();
            let login = read_login(&mut conn).await;
            accept(&mut conn, "assigned").await;
            login
        });

        let (_conn, run_id) = client.login("").await.unwrap();
        assert_eq!(run_id, "assigned");

        let login = relay.await.unwrap();
        assert!(login.run_id.is_empty());
        assert_eq!(login.version, PROTOCOL_VERSION);
        assert_eq!(login.pool_count, 1);
        assert_eq!(login.hostname, local_hostname());
        let auth = Authenticator::new("secret", vec![], 900);
        assert!(auth.verify_login(&login, login.timestamp).is_ok());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_hostname_comes_from_kernel() {
        let kernel = std::fs::read_to_string("/proc/sys/kernel/hostname").unwrap_or_default();
        if !kernel.trim().is_empty() {
            assert_eq!(local_hostname(), kernel.trim());
        }
    }

    #[tokio::test]
    async fn test_login_rejection_is_auth_rejected() {
        let (client, mut peers) = client(vec![]);
        tokio::spawn(async move {
            let mut conn = peers.recv().await.unwrap();
            read_login(&mut conn).await;
            let resp = LoginResp {
                error: "authorization failed".to_string(),
                ..LoginResp::default()
            };
            write_msg(&mut conn, &resp.into()).await.unwrap();
        });

        let Err(err) = client.login("").await else {
            panic!("login succeeded");
        };
        assert!(matches!(err, ClientError::AuthRejected(msg) if msg == "authorization failed"));
    }

    #[tokio::test]
    async fn test_first_login_failure_exits() {
        let (client, peers) = client(vec![]);
        drop(peers);
        let err = client.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ClientError::Connect(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resumes_run_id_and_reannounces() {
        let (client, mut peers) = client(vec![TunnelConfig::tcp("web", 8080, 9000)]);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(client.run(shutdown.clone()));

        let mut first = peers.recv().await.unwrap();
        assert!(read_login(&mut first).await.run_id.is_empty());
        accept(&mut first, "run-7").await;
        assert!(matches!(
            read_msg(&mut first, DEFAULT_MAX_MSG_LEN).await.unwrap(),
            Message::RegisterTunnel(reg) if reg.tunnel_name == "web"
        ));

        // The relay goes away; the client comes back with the same run id.
        let lost_at = tokio::time::Instant::now();
        drop(first);
        let mut second = peers.recv().await.unwrap();
        assert!(lost_at.elapsed() >= Duration::from_secs(1));
        assert_eq!(read_login(&mut second).await.run_id, "run-7");
        accept(&mut second, "run-7").await;
        assert!(matches!(
            read_msg(&mut second, DEFAULT_MAX_MSG_LEN).await.unwrap(),
            Message::RegisterTunnel(reg) if reg.tunnel_name == "web"
        ));

        shutdown.cancel();
        assert!(task.await.unwrap().is_ok());
    }
}

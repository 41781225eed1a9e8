//! Transport seam.
//!
//! Everything above this module works on [`BoxConn`], an owned bidirectional
//! byte stream. How the stream is produced (plain TCP here; TLS, QUIC or
//! websocket carriers elsewhere) is the business of a [`Connector`].

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Any stream usable as a control or work connection.
pub trait AsyncConn: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncConn for T {}

pub type BoxConn = Box<dyn AsyncConn>;

/// Dials physical connections to the relay.
///
/// `open` prepares shared transport state (a multiplexed session, a TLS
/// context) and is called once per login attempt; `connect` is called for
/// the control connection and for every work connection; `close` releases
/// whatever `open` set up.
pub trait Connector: Send + Sync + 'static {
    fn open(&self) -> impl Future<Output = io::Result<()>> + Send;
    fn connect(&self) -> impl Future<Output = io::Result<BoxConn>> + Send;
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Plain TCP connector with a dial timeout.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    dial_timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>, dial_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            dial_timeout,
        }
    }
}

impl Connector for TcpConnector {
    async fn open(&self) -> io::Result<()> {
        Ok(())
    }

    async fn connect(&self) -> io::Result<BoxConn> {
        let stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", self.addr),
                )
            })??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    async fn close(&self) {}
}

/// Splice two streams until both directions finish. Returns `(a_to_b, b_to_a)`
/// byte counts.
pub async fn join<A, B>(a: &mut A, b: &mut B) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    tokio::io::copy_bidirectional(a, b).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_connector_dials_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connector = TcpConnector::new(addr.to_string(), Duration::from_secs(5));

        connector.open().await.unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let mut conn = connector.connect().await.unwrap();
        let mut peer = accept.await.unwrap();

        conn.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        connector.close().await;
    }

    #[tokio::test]
    async fn test_join_copies_both_directions() {
        let (mut user, mut a) = tokio::io::duplex(64);
        let (mut b, mut target) = tokio::io::duplex(64);

        let splice = tokio::spawn(async move { join(&mut a, &mut b).await });

        user.write_all(b"request").await.unwrap();
        let mut buf = [0u8; 7];
        target.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");

        target.write_all(b"reply").await.unwrap();
        let mut buf = [0u8; 5];
        user.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");

        drop(user);
        drop(target);
        let (up, down) = splice.await.unwrap().unwrap();
        assert_eq!((up, down), (7, 5));
    }
}

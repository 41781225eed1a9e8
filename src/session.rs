//! Duties shared by both ends of a control connection.
//!
//! A control connection is driven by a reader, a writer and a manager task.
//! The reader and writer are identical on the server and the client and live
//! here; the manager (message dispatch + heartbeat) is side-specific.
//!
//! All duties observe one [`CancellationToken`] per session. Any duty that hits
//! an I/O or protocol error cancels it, and every other duty exits on the next
//! poll. Outbound messages go through a bounded queue drained by the single
//! writer, so frames are never interleaved.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::msg::{Message, MsgCodec};

/// Capacity of the inbound and outbound control queues.
pub const QUEUE_CAPACITY: usize = 10;

/// How often heartbeat deadlines are checked.
pub const HEARTBEAT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Enqueueing onto a session that is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("control session closed")]
pub struct SessionClosed;

/// Sending half of a session's outbound queue.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Message>,
    done: CancellationToken,
}

impl Outbox {
    /// Create the queue. The receiver belongs to [`write_loop`].
    pub fn channel(done: CancellationToken) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        (Self { tx, done }, rx)
    }

    /// Queue a message, waiting for room. Fails once the session is done.
    pub async fn send(&self, msg: impl Into<Message>) -> Result<(), SessionClosed> {
        let msg = msg.into();
        tokio::select! {
            biased;
            () = self.done.cancelled() => Err(SessionClosed),
            res = self.tx.send(msg) => res.map_err(|_| SessionClosed),
        }
    }

    /// Queue a message only if there is room. `Ok(false)` means the queue was
    /// full and the message was dropped.
    pub fn try_send(&self, msg: impl Into<Message>) -> Result<bool, SessionClosed> {
        if self.done.is_cancelled() {
            return Err(SessionClosed);
        }
        match self.tx.try_send(msg.into()) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SessionClosed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled() || self.tx.is_closed()
    }
}

/// Drain `rx` onto the wire until the session is done or a write fails.
///
/// Messages already queued when the session is cancelled are still written;
/// an in-flight write is never abandoned.
pub async fn write_loop<W>(
    mut sink: FramedWrite<W, MsgCodec>,
    mut rx: mpsc::Receiver<Message>,
    done: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            msg = rx.recv() => msg,
            () = done.cancelled() => None,
        };
        let Some(msg) = next else { break };
        let name = msg.name();
        if let Err(e) = sink.send(msg).await {
            warn!(error = %e, msg = name, "Control write failed");
            break;
        }
    }
    done.cancel();
}

/// Decode frames and forward them to the manager in arrival order.
pub async fn read_loop<R>(
    mut stream: FramedRead<R, MsgCodec>,
    tx: mpsc::Sender<Message>,
    done: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            () = done.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(msg)) => {
                let forwarded = tokio::select! {
                    () = done.cancelled() => false,
                    res = tx.send(msg) => res.is_ok(),
                };
                if !forwarded {
                    break;
                }
            }
            Some(Err(e)) if e.is_eof() => {
                debug!("Control connection closed by peer mid-frame");
                break;
            }
            Some(Err(e)) => {
                warn!(error = %e, "Control read failed");
                break;
            }
            None => {
                debug!("Control connection closed by peer");
                break;
            }
        }
    }
    done.cancel();
}

/// Last-heard-from clock, lock-free for the hot path.
#[derive(Debug)]
pub struct HeartbeatClock {
    epoch: Instant,
    last_ms: AtomicU64,
}

impl HeartbeatClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    /// Record activity now.
    pub fn touch(&self) {
        #[allow(clippy::cast_possible_truncation)]
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        self.last_ms.store(now_ms, Ordering::Relaxed);
    }

    /// Time since the last [`touch`](Self::touch) (or creation).
    pub fn elapsed(&self) -> Duration {
        #[allow(clippy::cast_possible_truncation)]
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now_ms.saturating_sub(self.last_ms.load(Ordering::Relaxed)))
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.elapsed() > timeout
    }
}

impl Default for HeartbeatClock {
    fn default() -> Self {
        Self::new()
    }
}

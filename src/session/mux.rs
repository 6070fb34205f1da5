//! Multiplexed connection — yamux over a [`Transport`]
//!
//! A yamux `Connection` only makes progress while it is polled, so each
//! connection is owned by one driver task:
//!
//! ```text
//!  open_stream() ──open_tx──▸ ┌──────────────┐ ◂──frames── Transport
//!                             │ driver task  │
//!  accept_stream() ◂─inbound─ └──────────────┘ ──frames──▸ Transport
//! ```
//!
//! - Opens are queued and answered in order through oneshot channels
//! - Inbound streams are forwarded to `accept_stream` callers
//! - Cancelling the lifecycle scope, or any connection error, stops the
//!   driver; pending and future operations then fail with `Closed`

use std::collections::VecDeque;
use std::future::Future;
use std::task::Poll;
use std::time::Duration;

use futures::future::poll_fn;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{FabricError, Result};
use crate::transport::Transport;

/// Upper bound on the graceful yamux close after the driver stops.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// One ordered, independent byte channel over the shared connection.
pub type LogicalStream = Compat<yamux::Stream>;

type OpenReply = oneshot::Sender<Result<yamux::Stream>>;

/// Multiplexer role, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Passive side: upgraded inbound connections, forkcomm children
    Server,
    /// Active side: upgrade dialers, forkcomm parents
    Client,
}

impl From<Role> for yamux::Mode {
    fn from(role: Role) -> Self {
        match role {
            Role::Server => yamux::Mode::Server,
            Role::Client => yamux::Mode::Client,
        }
    }
}

/// Handle to a driven yamux connection.
pub(crate) struct MuxConnection {
    role: Role,
    open_tx: mpsc::UnboundedSender<OpenReply>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<yamux::Stream>>,
    /// Fired once the driver task has stopped.
    stopped: CancellationToken,
}

impl MuxConnection {
    /// Take ownership of `transport` and start the driver task. The driver
    /// stops when `scope` is cancelled.
    pub(crate) fn start(transport: Transport, role: Role, scope: CancellationToken) -> Self {
        let peer = transport.peer_addr().to_string();
        let io = TokioAsyncReadCompatExt::compat(transport);
        let conn = yamux::Connection::new(io, yamux::Config::default(), role.into());

        let (open_tx, open_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let stopped = CancellationToken::new();

        tokio::spawn(drive(conn, open_rx, inbound_tx, scope, stopped.clone(), peer));

        Self {
            role,
            open_tx,
            inbound_rx: Mutex::new(inbound_rx),
            stopped,
        }
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Resolves once the driver has stopped.
    pub(crate) fn stopped(&self) -> impl Future<Output = ()> + '_ {
        self.stopped.cancelled()
    }

    pub(crate) async fn open_stream(&self) -> Result<LogicalStream> {
        if self.is_stopped() {
            return Err(FabricError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        self.open_tx.send(tx).map_err(|_| FabricError::Closed)?;
        let stream = rx.await.map_err(|_| FabricError::Closed)??;
        Ok(FuturesAsyncReadCompatExt::compat(stream))
    }

    pub(crate) async fn accept_stream(&self) -> Result<LogicalStream> {
        let mut inbound = self.inbound_rx.lock().await;
        tokio::select! {
            biased;
            stream = inbound.recv() => match stream {
                Some(stream) => Ok(FuturesAsyncReadCompatExt::compat(stream)),
                None => Err(FabricError::Closed),
            },
            _ = self.stopped.cancelled() => Err(FabricError::Closed),
        }
    }
}

/// Driver task: owns the yamux connection until the scope is cancelled or
/// the connection fails.
async fn drive(
    mut conn: yamux::Connection<Compat<Transport>>,
    mut open_rx: mpsc::UnboundedReceiver<OpenReply>,
    inbound_tx: mpsc::UnboundedSender<yamux::Stream>,
    scope: CancellationToken,
    stopped: CancellationToken,
    peer: String,
) {
    let mut waiting: VecDeque<OpenReply> = VecDeque::new();
    let cancelled = scope.cancelled();
    tokio::pin!(cancelled);

    let outcome = poll_fn(|cx| {
        if cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(None);
        }

        while let Poll::Ready(Some(reply)) = open_rx.poll_recv(cx) {
            waiting.push_back(reply);
        }

        while !waiting.is_empty() {
            match conn.poll_new_outbound(cx) {
                Poll::Ready(Ok(stream)) => {
                    if let Some(reply) = waiting.pop_front() {
                        // Caller may have timed out; dropping the stream resets it.
                        let _ = reply.send(Ok(stream));
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Some(e)),
                Poll::Pending => break,
            }
        }

        loop {
            match conn.poll_next_inbound(cx) {
                Poll::Ready(Some(Ok(stream))) => {
                    let _ = inbound_tx.send(stream);
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(e)),
                Poll::Ready(None) => return Poll::Ready(Some(yamux::ConnectionError::Closed)),
                Poll::Pending => return Poll::Pending,
            }
        }
    })
    .await;

    stopped.cancel();
    open_rx.close();
    while let Ok(reply) = open_rx.try_recv() {
        waiting.push_back(reply);
    }
    for reply in waiting.drain(..) {
        let _ = reply.send(Err(FabricError::Closed));
    }

    match outcome {
        None => {
            debug!("[mux] closing connection to {}", peer);
            match tokio::time::timeout(CLOSE_GRACE, poll_fn(|cx| conn.poll_close(cx))).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("[mux] close of {} reported: {}", peer, e),
                Err(_) => warn!("[mux] close of {} did not finish in {:?}", peer, CLOSE_GRACE),
            }
        }
        Some(yamux::ConnectionError::Closed) => info!("[mux] connection to {} closed by peer", peer),
        Some(e) => warn!("[mux] connection to {} failed: {}", peer, e),
    }

    // Peer-initiated close: make sure everything sharing the scope sees it.
    scope.cancel();
}

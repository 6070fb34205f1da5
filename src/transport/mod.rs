//! Transport Adapters
//!
//! Normalizes every duplex byte channel the fabric runs over into one
//! [`Transport`] value that the multiplexer owns:
//!
//! ```text
//! TcpStream ─────────────────────────────┐
//! TcpStream ── HTTP upgrade (hijack) ────┼──▸ Transport ──▸ yamux connection
//! child stdout + stdin / own stdin+out ──┘
//! ```
//!
//! Adapters never buffer or reorder payload bytes. `close` is idempotent.

mod listener;
mod pipe;
pub mod upgrade;

use std::io;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{Instant, Sleep};

pub use listener::{UpgradeListener, HANDSHAKE_TIMEOUT};
pub use pipe::PipePair;
pub use upgrade::{
    accept_upgrade, accept_upgrade_at, connect_upgrade, dial_upgrade, RequestHead, UpgradeRequest,
};

/// Peer address reported by pipe transports.
pub const PIPE_PEER_ADDR: &str = "pipe";

/// Any tokio duplex byte stream usable underneath a transport.
pub trait RawIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawIo for T {}

/// Which adapter produced a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Plain socket, passed through untouched
    Socket,
    /// Socket taken over after an HTTP upgrade handshake
    Upgraded,
    /// Read pipe + write pipe composed into one duplex view
    Pipe,
}

/// Uniform duplex byte channel.
pub struct Transport {
    io: Box<dyn RawIo>,
    kind: TransportKind,
    peer_addr: String,
    deadline: Option<Pin<Box<Sleep>>>,
    closed: bool,
}

impl Transport {
    fn new(io: Box<dyn RawIo>, kind: TransportKind, peer_addr: String) -> Self {
        Self {
            io,
            kind,
            peer_addr,
            deadline: None,
            closed: false,
        }
    }

    /// Wrap a connected socket.
    pub fn socket(stream: TcpStream) -> Self {
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let _ = stream.set_nodelay(true);
        Self::new(Box::new(stream), TransportKind::Socket, peer_addr)
    }

    /// Wrap a connection whose upgrade handshake has already completed.
    pub fn upgraded<S: RawIo + 'static>(io: S, peer_addr: impl Into<String>) -> Self {
        Self::new(Box::new(io), TransportKind::Upgraded, peer_addr.into())
    }

    /// Compose an inbound read stream and an outbound write stream.
    pub fn pipe<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::new(
            Box::new(PipePair::new(reader, writer)),
            TransportKind::Pipe,
            PIPE_PEER_ADDR.to_string(),
        )
    }

    /// This process's own stdin/stdout, as seen by a forkcomm child.
    pub fn stdio() -> Self {
        Self::pipe(tokio::io::stdin(), tokio::io::stdout())
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    /// Set or clear an I/O deadline. Once it passes, reads and writes fail
    /// with `TimedOut`, including ones already waiting on the peer. Pipes
    /// ignore deadlines; returns whether the deadline was applied.
    ///
    /// The transport is moved into its session, so a deadline can only cover
    /// the handshake phase before that. Must be called inside a runtime.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) -> bool {
        if self.kind == TransportKind::Pipe {
            return false;
        }
        self.deadline = deadline.map(|d| Box::pin(tokio::time::sleep_until(d)));
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Shut down the write side. Safe to call more than once; the read side
    /// and the descriptors are released when the transport is dropped.
    pub async fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.io.shutdown().await
    }

    /// Ready with an error once the deadline has passed. Otherwise registers
    /// the task to be woken when it does.
    fn poll_deadline(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        let expired = match self.deadline.as_mut() {
            Some(timer) => timer.as_mut().poll(cx).is_ready(),
            None => false,
        };
        if !expired {
            return Poll::Pending;
        }
        Poll::Ready(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("deadline exceeded on transport to {}", self.peer_addr),
        ))
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("kind", &self.kind)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.closed)
            .finish()
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Poll::Ready(err) = self.poll_deadline(cx) {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if let Poll::Ready(err) = self.poll_deadline(cx) {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.closed {
            return Poll::Ready(Ok(()));
        }
        let res = Pin::new(&mut self.io).poll_shutdown(cx);
        if res.is_ready() {
            self.closed = true;
        }
        res
    }
}

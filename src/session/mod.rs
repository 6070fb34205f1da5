//! Session — a multiplexed connection plus lifecycle scope and peer metadata
//!
//! Every peer the fabric talks to, whether a remote agent behind an HTTP
//! upgrade or a helper process behind a pipe pair, is a [`Session`]. Calls
//! (see [`crate::rpc`]) each run on a fresh logical stream of a session.
//!
//! Closing a session cancels its scope, which stops the multiplexer driver,
//! fails every blocked or future stream operation with
//! [`FabricError::Closed`] and, for process sessions, kills the child.

mod mux;

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{FabricError, Result};
use crate::transport::Transport;
use mux::MuxConnection;

pub use mux::{LogicalStream, Role};

/// A live (or closed) multiplexed session with one peer.
pub struct Session {
    key: String,
    peer_addr: String,
    mux: MuxConnection,
    scope: CancellationToken,
    closing: AtomicBool,
    pid: u32,
    child: Mutex<Option<Child>>,
}

impl Session {
    /// Build a session over `transport` with the given multiplexer role.
    ///
    /// Must be called from within a tokio runtime; the multiplexer driver is
    /// spawned immediately.
    pub fn new(key: impl Into<String>, transport: Transport, role: Role) -> Self {
        Self::build(key.into(), transport, role, None)
    }

    /// Build a client-role session that owns a spawned child process.
    pub(crate) fn with_child(key: String, transport: Transport, child: Child) -> Self {
        Self::build(key, transport, Role::Client, Some(child))
    }

    fn build(key: String, transport: Transport, role: Role, child: Option<Child>) -> Self {
        let peer_addr = transport.peer_addr().to_string();
        let scope = CancellationToken::new();
        let mux = MuxConnection::start(transport, role, scope.clone());
        let pid = child.as_ref().and_then(|c| c.id()).unwrap_or(0);

        debug!(
            "[session] {} started ({:?}, peer {}, pid {})",
            key, role, peer_addr, pid
        );

        Self {
            key,
            peer_addr,
            mux,
            scope,
            closing: AtomicBool::new(false),
            pid,
            child: Mutex::new(child),
        }
    }

    /// Peer key (hostname/label) this session is registered under.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub fn role(&self) -> Role {
        self.mux.role()
    }

    /// OS process id of the spawned child, 0 if this session has none.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Lifecycle scope. Tasks spawned on behalf of this session should use a
    /// child token of it.
    pub fn scope(&self) -> &CancellationToken {
        &self.scope
    }

    /// Whether the session was closed locally or its connection died.
    pub fn is_closed(&self) -> bool {
        self.scope.is_cancelled() || self.mux.is_stopped()
    }

    /// Resolves once the multiplexer has fully stopped.
    pub async fn closed(&self) {
        self.mux.stopped().await
    }

    /// Open a new logical stream to the peer. Safe to call concurrently.
    pub async fn open_stream(&self) -> Result<LogicalStream> {
        if self.is_closed() {
            return Err(FabricError::Closed);
        }
        tokio::select! {
            biased;
            _ = self.scope.cancelled() => Err(FabricError::Closed),
            stream = self.mux.open_stream() => stream,
        }
    }

    /// Wait for the peer to open a logical stream.
    pub async fn accept_stream(&self) -> Result<LogicalStream> {
        if self.is_closed() {
            return Err(FabricError::Closed);
        }
        tokio::select! {
            biased;
            _ = self.scope.cancelled() => Err(FabricError::Closed),
            stream = self.mux.accept_stream() => stream,
        }
    }

    /// Close the session. Runs once, even under concurrent callers:
    /// closes the multiplexer, kills the child if still alive and cancels
    /// the lifecycle scope.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        // Cancelling the scope stops the mux driver, which closes the transport.
        self.scope.cancel();

        if let Some(mut child) = self.child.lock().take() {
            match child.try_wait() {
                Ok(Some(status)) => debug!("[session] {} child already exited: {}", self.key, status),
                _ => {
                    if let Err(e) = child.start_kill() {
                        warn!("[session] {} failed to kill child {}: {}", self.key, self.pid, e);
                    }
                    if let Ok(handle) = tokio::runtime::Handle::try_current() {
                        handle.spawn(async move {
                            let _ = child.wait().await;
                        });
                    }
                }
            }
        }

        info!("[session] {} closed", self.key);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("peer_addr", &self.peer_addr)
            .field("role", &self.role())
            .field("pid", &self.pid)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

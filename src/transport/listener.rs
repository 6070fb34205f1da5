//! Upgrade listener — accepts agent connections on the control plane
//!
//! Each accepted TCP connection is hijacked via the upgrade handshake,
//! registered under the peer key the agent presents, and served with the
//! shared router until it closes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::accept_upgrade_at;
use crate::config::FabricConfig;
use crate::error::Result;
use crate::registry::SessionRegistry;
use crate::rpc::Router;
use crate::session::{Role, Session};

/// Time an inbound connection gets to complete its handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accept loop feeding a [`SessionRegistry`].
pub struct UpgradeListener {
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    router: Arc<Router>,
    upgrade_path: String,
    peer_header: String,
}

impl UpgradeListener {
    pub async fn bind(
        config: &FabricConfig,
        registry: Arc<SessionRegistry>,
        router: Arc<Router>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr).await?;
        info!("[listener] listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            registry,
            router,
            upgrade_path: config.upgrade_path.clone(),
            peer_header: config.peer_header.clone(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let settings = Arc::new((self.upgrade_path, self.peer_header));

        loop {
            let (stream, remote) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("[listener] accept failed: {}", e);
                        continue;
                    }
                },
            };

            let registry = self.registry.clone();
            let router = self.router.clone();
            let settings = settings.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                let session = match tokio::time::timeout(
                    HANDSHAKE_TIMEOUT,
                    register_connection(stream, remote, &registry, &settings.0, &settings.1),
                )
                .await
                {
                    Ok(Ok(session)) => session,
                    Ok(Err(e)) => {
                        debug!("[listener] rejected {}: {}", remote, e);
                        return;
                    }
                    Err(_) => {
                        debug!("[listener] handshake from {} timed out", remote);
                        return;
                    }
                };

                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = session.serve(router) => {}
                }
                registry.evict(session.key(), &session);
            });
        }

        info!("[listener] stopped");
    }
}

/// Hijack one connection and register it, replacing any previous session
/// for the same peer.
async fn register_connection(
    stream: TcpStream,
    remote: SocketAddr,
    registry: &SessionRegistry,
    upgrade_path: &str,
    peer_header: &str,
) -> Result<Arc<Session>> {
    let _ = stream.set_nodelay(true);
    let (head, transport) = accept_upgrade_at(stream, remote.to_string(), upgrade_path).await?;

    let key = head
        .header(peer_header)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| remote.ip().to_string());

    let session = Arc::new(Session::new(key, transport, Role::Server));
    registry.insert(session.clone());
    info!("[listener] {} connected from {}", session.key(), remote);
    Ok(session)
}

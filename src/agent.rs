//! Agent side — dial the control plane and answer its calls
//!
//! ```text
//! ┌──────────────┐   GET <path>, Upgrade: tcp   ┌───────────────┐
//! │    agent     │ ───────────────────────────▸ │ control plane │
//! │ mux (client) │ ◂─── 101, then yamux ──────▸ │ mux (server)  │
//! └──────────────┘                              └───────────────┘
//! ```
//!
//! The agent presents its peer key in a handshake header; the control plane
//! registers the session under it. No reconnection: when the session ends,
//! [`AgentDialer::run`] returns and the caller decides what to do.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::FabricConfig;
use crate::error::{FabricError, Result};
use crate::rpc::Router;
use crate::session::{Role, Session};
use crate::transport::{connect_upgrade, UpgradeRequest};

/// Hostname of this machine, the default peer key.
pub fn local_peer_key() -> String {
    hostname::get()
        .ok()
        .map(|h| h.to_string_lossy().into_owned())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Dial settings for one control-plane connection
#[derive(Debug, Clone)]
pub struct AgentDialer {
    server_addr: String,
    upgrade_path: String,
    peer_header: String,
    peer_key: String,
    headers: Vec<(String, String)>,
}

impl AgentDialer {
    pub fn new(server_addr: impl Into<String>, peer_key: impl Into<String>) -> Self {
        let defaults = FabricConfig::default();
        Self {
            server_addr: server_addr.into(),
            upgrade_path: defaults.upgrade_path,
            peer_header: defaults.peer_header,
            peer_key: peer_key.into(),
            headers: Vec::new(),
        }
    }

    /// Build from the `agent` section of `config`.
    pub fn from_config(config: &FabricConfig) -> Result<Self> {
        let agent = config
            .agent
            .as_ref()
            .ok_or_else(|| FabricError::Config("missing `agent` section".into()))?;
        Ok(Self {
            server_addr: agent.server_addr.clone(),
            upgrade_path: config.upgrade_path.clone(),
            peer_header: config.peer_header.clone(),
            peer_key: agent.peer_key.clone().unwrap_or_else(local_peer_key),
            headers: agent.headers.clone(),
        })
    }

    pub fn peer_key(&self) -> &str {
        &self.peer_key
    }

    fn request(&self) -> UpgradeRequest {
        self.headers.iter().fold(
            UpgradeRequest::new(&self.server_addr, &self.upgrade_path)
                .header(&self.peer_header, &self.peer_key),
            |req, (name, value)| req.header(name, value),
        )
    }

    /// Dial, upgrade, and wrap the connection in a client-role session.
    pub async fn connect(&self) -> Result<Session> {
        let transport = connect_upgrade(&self.server_addr, &self.request()).await?;
        info!("[agent] connected to {} as {}", self.server_addr, self.peer_key);
        Ok(Session::new(self.server_addr.clone(), transport, Role::Client))
    }

    /// Connect and answer calls with `router` until the session ends or
    /// `cancel` fires.
    pub async fn run(&self, router: Router, cancel: CancellationToken) -> Result<()> {
        let session = self.connect().await?;
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = session.serve(Arc::new(router)) => {}
        }
        session.close();
        info!("[agent] session with {} ended", self.server_addr);
        Ok(())
    }
}

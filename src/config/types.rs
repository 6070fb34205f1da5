//! Configuration Types
//!
//! Data structures for fabric configuration with version support for migrations.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FabricError, Result};
use crate::rpc::DEFAULT_CALL_TIMEOUT;

/// Current configuration version
pub const CONFIG_VERSION: u32 = 1;

/// Environment variable that marks a process as a forkcomm child.
pub const DEFAULT_CHILD_ENV: &str = "FLEETLINK_CHILD";

/// Fan-out poller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Number of concurrent ping workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Per-peer ping timeout in seconds
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,

    /// Heartbeat sweep interval in seconds (0 = disabled)
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
}

fn default_workers() -> usize {
    10
}

fn default_ping_timeout() -> u64 {
    3
}

fn default_interval() -> u64 {
    30
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            ping_timeout_secs: default_ping_timeout(),
            interval_secs: default_interval(),
        }
    }
}

impl PollerConfig {
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    /// `None` when the heartbeat is disabled.
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
    }
}

/// Agent-side dial settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Control-plane address (host:port)
    pub server_addr: String,

    /// Identity presented to the server; defaults to the local hostname
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_key: Option<String>,

    /// Extra handshake headers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,
}

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FabricConfig {
    /// Configuration version
    #[serde(default = "default_version")]
    pub version: u32,

    /// Listener address for inbound agent upgrades
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Request path that the upgrade handshake targets
    #[serde(default = "default_upgrade_path")]
    pub upgrade_path: String,

    /// Handshake header carrying the peer key
    #[serde(default = "default_peer_header")]
    pub peer_header: String,

    /// Default timeout for RPC calls in seconds
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Environment variable that marks a forkcomm child
    #[serde(default = "default_child_env")]
    pub child_env: String,

    #[serde(default)]
    pub poller: PollerConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentConfig>,
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

fn default_listen_addr() -> String {
    "0.0.0.0:8008".to_string()
}

fn default_upgrade_path() -> String {
    "/plus/arpc".to_string()
}

fn default_peer_header() -> String {
    "X-Fleet-Peer".to_string()
}

fn default_call_timeout() -> u64 {
    DEFAULT_CALL_TIMEOUT.as_secs()
}

fn default_child_env() -> String {
    DEFAULT_CHILD_ENV.to_string()
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            listen_addr: default_listen_addr(),
            upgrade_path: default_upgrade_path(),
            peer_header: default_peer_header(),
            call_timeout_secs: default_call_timeout(),
            child_env: default_child_env(),
            poller: PollerConfig::default(),
            agent: None,
        }
    }
}

impl FabricConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| FabricError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&raw)
    }

    /// Parse and validate configuration from JSON text
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| FabricError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.version > CONFIG_VERSION {
            return Err(FabricError::Config(format!(
                "unsupported config version {} (max {})",
                self.version, CONFIG_VERSION
            )));
        }
        if !self.upgrade_path.starts_with('/') {
            return Err(FabricError::Config(format!(
                "upgrade_path must start with '/': {}",
                self.upgrade_path
            )));
        }
        if self.call_timeout_secs == 0 {
            return Err(FabricError::Config("call_timeout_secs must be > 0".into()));
        }
        if self.poller.workers == 0 {
            return Err(FabricError::Config("poller.workers must be > 0".into()));
        }
        if self.child_env.is_empty() {
            return Err(FabricError::Config("child_env must not be empty".into()));
        }
        Ok(())
    }

    /// Timeout for calls made without a more specific limit, such as the
    /// forkcomm handshake.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = FabricConfig::from_json(r#"{ "listen_addr": "127.0.0.1:9000" }"#).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.upgrade_path, "/plus/arpc");
        assert_eq!(config.poller.workers, 10);
        assert_eq!(config.poller.ping_timeout(), Duration::from_secs(3));
        assert_eq!(config.child_env, DEFAULT_CHILD_ENV);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(FabricConfig::from_json(r#"{ "upgrade_path": "no-slash" }"#).is_err());
        assert!(FabricConfig::from_json(r#"{ "poller": { "workers": 0 } }"#).is_err());
        assert!(FabricConfig::from_json(r#"{ "version": 99 }"#).is_err());
    }

    #[test]
    fn test_call_timeout_default_and_override() {
        assert_eq!(FabricConfig::default().call_timeout(), DEFAULT_CALL_TIMEOUT);

        let config = FabricConfig::from_json(r#"{ "call_timeout_secs": 5 }"#).unwrap();
        assert_eq!(config.call_timeout(), Duration::from_secs(5));
        assert!(FabricConfig::from_json(r#"{ "call_timeout_secs": 0 }"#).is_err());
    }

    #[test]
    fn test_heartbeat_can_be_disabled() {
        let config = FabricConfig::from_json(r#"{ "poller": { "interval_secs": 0 } }"#).unwrap();
        assert!(config.poller.interval().is_none());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "agent": {{ "server_addr": "10.0.0.1:8008", "headers": [["X-Token", "abc"]] }} }}"#
        )
        .unwrap();

        let config = FabricConfig::load(file.path()).unwrap();
        let agent = config.agent.unwrap();
        assert_eq!(agent.server_addr, "10.0.0.1:8008");
        assert_eq!(agent.headers, vec![("X-Token".to_string(), "abc".to_string())]);
        assert!(agent.peer_key.is_none());
    }
}

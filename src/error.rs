//! Fabric error types

use std::time::Duration;

use thiserror::Error;

/// Errors raised by transports, sessions, calls and forkcomm.
#[derive(Debug, Error)]
pub enum FabricError {
    /// Dial/accept/hijack or raw stream I/O failure.
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Upgrade handshake failed: {0}")]
    UpgradeProtocol(String),

    #[error("Multiplexer error: {0}")]
    Multiplexer(String),

    #[error("Session closed")]
    Closed,

    #[error("Call timed out after {0:?}")]
    CallTimeout(Duration),

    #[error("Malformed call payload: {0}")]
    CallProtocol(String),

    /// The peer answered with an explicit error frame.
    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Child process error: {0}")]
    ChildProcess(String),

    #[error("Not running as a spawned child: {0} is not set to \"1\"")]
    NotAChild(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl FabricError {
    /// Whether this error means the underlying connection is gone, as opposed
    /// to a failure local to a single call.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Self::Closed | Self::Multiplexer(_))
    }
}

impl From<yamux::ConnectionError> for FabricError {
    fn from(e: yamux::ConnectionError) -> Self {
        match e {
            yamux::ConnectionError::Closed => FabricError::Closed,
            other => FabricError::Multiplexer(other.to_string()),
        }
    }
}

impl From<rmp_serde::encode::Error> for FabricError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        FabricError::CallProtocol(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for FabricError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        FabricError::CallProtocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FabricError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_fatal_classification() {
        assert!(FabricError::Closed.is_connection_fatal());
        assert!(FabricError::Multiplexer("reset".into()).is_connection_fatal());
        assert!(!FabricError::CallTimeout(Duration::from_secs(3)).is_connection_fatal());
        assert!(!FabricError::Remote("no such method".into()).is_connection_fatal());
    }

    #[test]
    fn test_not_a_child_message_names_variable() {
        let err = FabricError::NotAChild("FLEETLINK_CHILD".into());
        assert!(err.to_string().contains("FLEETLINK_CHILD"));
    }

    #[test]
    fn test_yamux_closed_maps_to_closed() {
        let err: FabricError = yamux::ConnectionError::Closed.into();
        assert!(matches!(err, FabricError::Closed));
    }
}

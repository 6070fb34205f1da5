//! Configuration Module
//!
//! Fabric settings: listener address, upgrade handshake parameters, call
//! timeouts, fan-out sizing and the forkcomm child marker. Loaded from a JSON
//! file; every field has a default so partial files are accepted.

pub mod types;

pub use types::{AgentConfig, FabricConfig, PollerConfig, CONFIG_VERSION};

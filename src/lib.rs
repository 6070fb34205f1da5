//! Fleetlink — multiplexed session RPC for backup agents and helper processes
//!
//! One call layer runs identically over a TCP connection, an HTTP-upgraded
//! connection, or a pipe pair to a child process:
//!
//! - [`transport`] normalizes the byte channels and performs the upgrade
//!   handshake
//! - [`session`] multiplexes logical streams over a transport
//! - [`rpc`] runs one request/response call per logical stream
//! - [`registry`] keeps live sessions keyed by peer
//! - [`forkcomm`] spawns helper processes (or attaches to the parent)
//! - [`poller`] pings many peers with bounded concurrency

pub mod agent;
pub mod config;
pub mod error;
pub mod forkcomm;
pub mod poller;
pub mod registry;
pub mod rpc;
pub mod session;
pub mod transport;

pub use config::FabricConfig;
pub use error::{FabricError, Result};
pub use registry::SessionRegistry;
pub use rpc::Router;
pub use session::{Role, Session};
pub use transport::Transport;

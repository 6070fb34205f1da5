//! forkcomm — sessions with locally spawned helper processes
//!
//! A helper process is just another peer: the parent wires the child's stdio
//! into a pipe transport and runs the same session/call machinery used for
//! network agents.
//!
//! ```text
//! ┌──────────────┐  child stdin  ┌──────────────┐
//! │    parent    │ ────────────▸ │    child     │
//! │ mux (client) │ ◂──────────── │ mux (server) │
//! └──────────────┘  child stdout └──────────────┘
//! ```
//!
//! Workflow:
//! 1. Parent spawns the child with the marker variable set to `"1"`
//! 2. Child validates the marker ([`ChildMode`]) and attaches to its stdio
//! 3. Parent optionally handshakes with `ping`
//!
//! The child's stderr is inherited, so child logging must go to stderr.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::types::DEFAULT_CHILD_ENV;
use crate::error::{FabricError, Result};
use crate::rpc::{PingResponse, Router};
use crate::session::{Role, Session};
use crate::transport::Transport;

/// Peer key given to the parent session inside a child.
pub const PARENT_KEY: &str = "parent";

/// Proof that this process was started as a forkcomm child.
///
/// Only obtainable by validating the marker variable, so a process can never
/// fall into child mode by accident.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildMode {
    marker: String,
}

impl ChildMode {
    /// Validate the default marker variable.
    pub fn from_env() -> Result<Self> {
        Self::from_env_var(DEFAULT_CHILD_ENV)
    }

    /// Validate `marker`: it must be set to exactly `"1"`.
    pub fn from_env_var(marker: &str) -> Result<Self> {
        match std::env::var(marker) {
            Ok(value) if value == "1" => Ok(Self {
                marker: marker.to_string(),
            }),
            _ => Err(FabricError::NotAChild(marker.to_string())),
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }
}

/// How to start a helper process
#[derive(Debug, Clone)]
pub struct ChildCommand {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    marker: String,
    key: Option<String>,
}

impl ChildCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            marker: DEFAULT_CHILD_ENV.to_string(),
            key: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Marker variable name, when not the default
    pub fn marker(mut self, marker: impl Into<String>) -> Self {
        self.marker = marker.into();
        self
    }

    /// Session key; defaults to the program's file name
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    fn session_key(&self) -> String {
        self.key.clone().unwrap_or_else(|| {
            self.program
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.program.display().to_string())
        })
    }
}

/// Parent side: spawn the helper and wrap its stdio in a client-role session.
///
/// The returned session owns the child; closing it kills the child.
pub fn spawn_child(command: &ChildCommand) -> Result<Session> {
    let mut cmd = tokio::process::Command::new(&command.program);
    cmd.args(&command.args)
        .envs(command.envs.iter().map(|(k, v)| (k, v)))
        .env(&command.marker, "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| {
        FabricError::ChildProcess(format!(
            "failed to spawn {}: {}",
            command.program.display(),
            e
        ))
    })?;

    // Dropping `child` on these paths kills it (kill_on_drop).
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| FabricError::ChildProcess("child stdout was not captured".into()))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| FabricError::ChildProcess("child stdin was not captured".into()))?;

    let key = command.session_key();
    let session = Session::with_child(key, Transport::pipe(stdout, stdin), child);
    info!(
        "[forkcomm] spawned {} (pid {})",
        command.program.display(),
        session.pid()
    );
    Ok(session)
}

/// Spawn the helper and confirm it answers `ping` within `timeout`.
pub async fn spawn_child_checked(
    command: &ChildCommand,
    timeout: Duration,
) -> Result<(Session, PingResponse)> {
    let session = spawn_child(command)?;
    match session.ping(timeout).await {
        Ok(info) => {
            debug!(
                "[forkcomm] {} ready: v{} (pid {})",
                session.key(),
                info.version,
                session.pid()
            );
            Ok((session, info))
        }
        Err(e) => {
            warn!("[forkcomm] {} handshake failed: {}", session.key(), e);
            session.close();
            Err(FabricError::ChildProcess(format!("handshake failed: {}", e)))
        }
    }
}

/// Child side: attach to the parent over this process's stdin/stdout.
pub fn attach_to_parent(mode: &ChildMode) -> Session {
    debug!("[forkcomm] attaching to parent ({} = 1)", mode.marker());
    Session::new(PARENT_KEY, Transport::stdio(), Role::Server)
}

/// Child side, validating `marker` first. Fails with `NotAChild` before any
/// pipe I/O when the marker is missing.
pub fn parent_from_env(marker: &str) -> Result<Session> {
    let mode = ChildMode::from_env_var(marker)?;
    Ok(attach_to_parent(&mode))
}

/// Child side main loop: answer the parent's calls until it goes away.
pub async fn serve_parent(mode: &ChildMode, router: Router) {
    let session = attach_to_parent(mode);
    session.serve(Arc::new(router)).await;
    info!("[forkcomm] parent disconnected");
    session.close();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_marker_is_not_a_child() {
        let err = ChildMode::from_env_var("FLEETLINK_TEST_MARKER_NEVER_SET").unwrap_err();
        assert!(matches!(err, FabricError::NotAChild(ref m) if m == "FLEETLINK_TEST_MARKER_NEVER_SET"));
    }

    #[test]
    fn test_marker_must_be_exactly_one() {
        std::env::set_var("FLEETLINK_TEST_MARKER_ZERO", "0");
        assert!(ChildMode::from_env_var("FLEETLINK_TEST_MARKER_ZERO").is_err());

        std::env::set_var("FLEETLINK_TEST_MARKER_ONE", "1");
        let mode = ChildMode::from_env_var("FLEETLINK_TEST_MARKER_ONE").unwrap();
        assert_eq!(mode.marker(), "FLEETLINK_TEST_MARKER_ONE");
    }

    #[tokio::test]
    async fn test_parent_from_env_fails_fast_without_marker() {
        let err = parent_from_env("FLEETLINK_TEST_MARKER_ABSENT").unwrap_err();
        assert!(matches!(err, FabricError::NotAChild(_)));
    }

    #[tokio::test]
    async fn test_spawn_nonexistent_program_fails() {
        let err = spawn_child(&ChildCommand::new("/nonexistent/fleetlink-helper")).unwrap_err();
        assert!(matches!(err, FabricError::ChildProcess(_)));
    }

    #[test]
    fn test_session_key_defaults_to_file_name() {
        assert_eq!(ChildCommand::new("/usr/lib/fleet/helper").session_key(), "helper");
        assert_eq!(ChildCommand::new("/x/helper").key("vss").session_key(), "vss");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_close_kills_child_and_is_idempotent() {
        let session = Arc::new(spawn_child(&ChildCommand::new("sleep").arg("30")).unwrap());
        let pid = session.pid();
        assert!(pid > 0);
        assert_eq!(session.role(), Role::Client);

        let closers: Vec<_> = (0..4)
            .map(|_| {
                let session = session.clone();
                tokio::spawn(async move { session.close() })
            })
            .collect();
        for closer in closers {
            closer.await.unwrap();
        }
        session.close();

        assert!(session.is_closed());
        let opened = tokio::time::timeout(Duration::from_secs(1), session.open_stream()).await;
        assert!(matches!(opened, Ok(Err(FabricError::Closed))));

        // The process must be killed and reaped, not just detached.
        let gone = tokio::time::timeout(Duration::from_secs(5), async {
            while process_exists(pid) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(gone.is_ok(), "child {} still running after close", pid);
    }

    #[cfg(unix)]
    fn process_exists(pid: u32) -> bool {
        std::process::Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_handshake_failure_closes_child() {
        // `cat` echoes our frames back instead of answering them.
        let result =
            spawn_child_checked(&ChildCommand::new("cat"), Duration::from_millis(500)).await;
        assert!(matches!(result, Err(FabricError::ChildProcess(_))));
    }
}

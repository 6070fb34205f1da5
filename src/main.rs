//! fleetlink — control-plane server, agent and forkcomm child entry points
//!
//! Logs always go to stderr: in `child` mode stdout carries the session.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fleetlink::agent::{local_peer_key, AgentDialer};
use fleetlink::config::AgentConfig;
use fleetlink::forkcomm::{self, ChildCommand, ChildMode};
use fleetlink::poller::Poller;
use fleetlink::transport::UpgradeListener;
use fleetlink::{FabricConfig, Router, SessionRegistry};

#[derive(Parser, Debug)]
#[command(name = "fleetlink")]
#[command(about = "Session RPC fabric for backup agents and helper processes")]
struct Args {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept agent connections and heartbeat them
    Serve {
        /// Listen address (overrides config)
        #[arg(long)]
        listen: Option<String>,
    },
    /// Dial a control plane and answer its calls
    Agent {
        /// Control-plane address (overrides config)
        #[arg(long)]
        server: Option<String>,

        /// Peer key to present (defaults to hostname)
        #[arg(long)]
        peer_key: Option<String>,
    },
    /// Answer calls from the parent over stdin/stdout
    Child,
    /// Spawn a helper and ping it
    PingChild {
        /// Helper program (defaults to this binary in child mode)
        program: Option<PathBuf>,

        /// Handshake and call timeout (defaults to `call_timeout_secs`)
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "fleetlink=debug" } else { "fleetlink=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let config = match &args.config {
        Some(path) => FabricConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => FabricConfig::default(),
    };

    match args.command {
        Command::Serve { listen } => serve(config, listen).await,
        Command::Agent { server, peer_key } => agent(config, server, peer_key).await,
        Command::Child => child(config).await,
        Command::PingChild {
            program,
            timeout_secs,
        } => {
            let timeout = timeout_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.call_timeout());
            ping_child(config, args.config, program, timeout).await
        }
    }
}

async fn serve(mut config: FabricConfig, listen: Option<String>) -> Result<()> {
    if let Some(listen) = listen {
        config.listen_addr = listen;
    }

    let registry = Arc::new(SessionRegistry::new());
    let router = Arc::new(Router::with_ping());
    let cancel = CancellationToken::new();

    let listener = UpgradeListener::bind(&config, registry.clone(), router).await?;
    let accept_task = tokio::spawn(listener.run(cancel.clone()));

    let heartbeat_task = config.poller.interval().map(|interval| {
        let poller = Poller::from_config(registry.clone(), &config.poller);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            poller
                .run_heartbeat(interval, cancel, |table, report| {
                    info!(
                        "[heartbeat] {} peers: {} alive, {} failed, {} skipped",
                        table.len(),
                        report.succeeded,
                        report.failed,
                        report.skipped
                    );
                })
                .await
        })
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    cancel.cancel();

    let _ = accept_task.await;
    if let Some(task) = heartbeat_task {
        let _ = task.await;
    }
    registry.close_all();
    Ok(())
}

async fn agent(
    mut config: FabricConfig,
    server: Option<String>,
    peer_key: Option<String>,
) -> Result<()> {
    if let Some(server_addr) = server {
        let existing = config.agent.take();
        config.agent = Some(AgentConfig {
            server_addr,
            peer_key: existing.as_ref().and_then(|a| a.peer_key.clone()),
            headers: existing.map(|a| a.headers).unwrap_or_default(),
        });
    }
    if let (Some(key), Some(agent)) = (peer_key, config.agent.as_mut()) {
        agent.peer_key = Some(key);
    }

    let dialer = AgentDialer::from_config(&config)
        .context("no control-plane address; pass --server or set `agent.server_addr`")?;
    info!("Agent {} (host {})", dialer.peer_key(), local_peer_key());

    let cancel = CancellationToken::new();
    let stop = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.cancel();
        }
    });

    dialer.run(Router::with_ping(), cancel).await?;
    Ok(())
}

async fn child(config: FabricConfig) -> Result<()> {
    let mode = ChildMode::from_env_var(&config.child_env)?;
    forkcomm::serve_parent(&mode, Router::with_ping()).await;
    Ok(())
}

async fn ping_child(
    config: FabricConfig,
    config_path: Option<PathBuf>,
    program: Option<PathBuf>,
    timeout: Duration,
) -> Result<()> {
    let command = match program {
        Some(program) => ChildCommand::new(program),
        None => {
            let command = ChildCommand::new(std::env::current_exe()?).arg("child");
            match config_path {
                Some(path) => command.arg("--config").arg(path),
                None => command,
            }
        }
    }
    .marker(config.child_env.clone());

    let (session, pong) = forkcomm::spawn_child_checked(&command, timeout).await?;
    println!(
        "pid {} version {} host {}",
        session.pid(),
        pong.version,
        pong.hostname.as_deref().unwrap_or("-")
    );
    if let Err(e) = session.ping(timeout).await {
        warn!("second ping failed: {}", e);
    }
    session.close();
    Ok(())
}

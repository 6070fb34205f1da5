//! Control plane and agent over loopback TCP: the agent dials and upgrades,
//! the listener registers it, and the poller sweeps the registry.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use fleetlink::agent::AgentDialer;
use fleetlink::poller::{PeerTable, Poller};
use fleetlink::transport::{connect_upgrade, UpgradeListener, UpgradeRequest};
use fleetlink::{FabricConfig, FabricError, Router, SessionRegistry};

async fn start_listener(registry: Arc<SessionRegistry>, cancel: CancellationToken) -> String {
    let mut config = FabricConfig::default();
    config.listen_addr = "127.0.0.1:0".into();

    let listener = UpgradeListener::bind(&config, registry, Arc::new(Router::with_ping()))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(listener.run(cancel));
    addr
}

async fn wait_for_peer(registry: &SessionRegistry, key: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while registry.get(key).is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_agent_registers_and_answers_sweep() {
    let registry = Arc::new(SessionRegistry::new());
    let cancel = CancellationToken::new();
    let addr = start_listener(registry.clone(), cancel.clone()).await;

    let agent_cancel = cancel.child_token();
    let dialer = AgentDialer::new(addr, "nas01");
    let agent = tokio::spawn(async move { dialer.run(Router::with_ping(), agent_cancel).await });

    wait_for_peer(&registry, "nas01").await;
    let session = registry.get("nas01").unwrap();
    let pong = session.ping(Duration::from_secs(3)).await.unwrap();
    assert_eq!(pong.version, env!("CARGO_PKG_VERSION"));

    let table = PeerTable::new(["nas01", "ghost"]);
    let report = Poller::new(registry.clone(), 2, Duration::from_secs(3))
        .sweep(&table)
        .await;
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.skipped, 1);
    assert!(table.get(0).unwrap().alive);
    assert!(!table.get(1).unwrap().alive);

    cancel.cancel();
    agent.await.unwrap().unwrap();
    tokio::time::timeout(Duration::from_secs(5), session.closed())
        .await
        .unwrap();
    registry.close_all();
}

#[tokio::test]
async fn test_reconnect_replaces_previous_session() {
    let registry = Arc::new(SessionRegistry::new());
    let cancel = CancellationToken::new();
    let addr = start_listener(registry.clone(), cancel.clone()).await;

    let first = AgentDialer::new(addr.clone(), "nas02").connect().await.unwrap();
    wait_for_peer(&registry, "nas02").await;
    let old = registry.get("nas02").unwrap();

    let _second = AgentDialer::new(addr, "nas02").connect().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while registry
            .get("nas02")
            .is_some_and(|current| Arc::ptr_eq(&current, &old))
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert!(old.is_closed());
    assert_eq!(registry.len(), 1);
    tokio::time::timeout(Duration::from_secs(5), first.closed())
        .await
        .unwrap();
    cancel.cancel();
}

#[tokio::test]
async fn test_wrong_path_is_refused() {
    let registry = Arc::new(SessionRegistry::new());
    let cancel = CancellationToken::new();
    let addr = start_listener(registry.clone(), cancel.clone()).await;

    let request = UpgradeRequest::new(addr.clone(), "/elsewhere").header("X-Fleet-Peer", "nas03");
    let err = connect_upgrade(&addr, &request).await.unwrap_err();
    assert!(matches!(err, FabricError::UpgradeProtocol(_)));
    assert!(registry.is_empty());
    cancel.cancel();
}

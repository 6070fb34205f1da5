//! Fan-out poller
//!
//! Pings many peers with a bounded number of concurrent workers and records
//! each peer's reported version in a shared status table.
//!
//! One sweep:
//! 1. Every table index is queued up front and the queue is closed
//! 2. `workers` tasks drain the queue, one ping at a time each
//! 3. The sweep returns once every worker has exited
//!
//! Per-peer failures never abort a sweep. A peer without a registered
//! session is skipped, and a peer whose ping fails keeps its previous status.
//! [`SweepReport`] counts what happened.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PollerConfig;
use crate::registry::SessionRegistry;

/// Last known state of one peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PeerStatus {
    pub hostname: String,
    pub version: Option<String>,
    pub alive: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

impl PeerStatus {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ..Default::default()
        }
    }
}

/// Shared, index-addressed status slots. Cloning shares the slots.
#[derive(Debug, Clone, Default)]
pub struct PeerTable {
    slots: Arc<Vec<Mutex<PeerStatus>>>,
}

impl PeerTable {
    pub fn new<I, S>(hostnames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_statuses(hostnames.into_iter().map(PeerStatus::new))
    }

    pub fn from_statuses(statuses: impl IntoIterator<Item = PeerStatus>) -> Self {
        Self {
            slots: Arc::new(statuses.into_iter().map(Mutex::new).collect()),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<PeerStatus> {
        self.slots.get(index).map(|slot| slot.lock().clone())
    }

    /// Copy of every slot, in index order.
    pub fn snapshot(&self) -> Vec<PeerStatus> {
        self.slots.iter().map(|slot| slot.lock().clone()).collect()
    }

    /// New table for `hostnames`, carrying over known statuses.
    pub fn refreshed(&self, mut hostnames: Vec<String>) -> Self {
        hostnames.sort();
        hostnames.dedup();
        let previous = self.snapshot();
        Self::from_statuses(hostnames.into_iter().map(|hostname| {
            previous
                .iter()
                .find(|status| status.hostname == hostname)
                .cloned()
                .unwrap_or_else(|| PeerStatus::new(hostname))
        }))
    }

    fn hostname(&self, index: usize) -> Option<String> {
        self.slots.get(index).map(|slot| slot.lock().hostname.clone())
    }

    fn record_alive(&self, index: usize, version: String) {
        if let Some(slot) = self.slots.get(index) {
            let mut status = slot.lock();
            status.version = Some(version);
            status.alive = true;
            status.last_seen = Some(Utc::now());
        }
    }
}

/// Outcome counters for one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Peers that had a session and were pinged
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Peers with no registered session
    pub skipped: usize,
    pub last_error: Option<String>,
}

impl SweepReport {
    fn merge(&mut self, other: SweepReport) {
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.skipped += other.skipped;
        if other.last_error.is_some() {
            self.last_error = other.last_error;
        }
    }
}

/// Bounded-concurrency pinger over a session registry.
pub struct Poller {
    registry: Arc<SessionRegistry>,
    workers: usize,
    timeout: Duration,
}

impl Poller {
    pub fn new(registry: Arc<SessionRegistry>, workers: usize, timeout: Duration) -> Self {
        Self {
            registry,
            workers: workers.max(1),
            timeout,
        }
    }

    pub fn from_config(registry: Arc<SessionRegistry>, config: &PollerConfig) -> Self {
        Self::new(registry, config.workers, config.ping_timeout())
    }

    /// Ping every peer in `table` once and update successful slots in place.
    pub async fn sweep(&self, table: &PeerTable) -> SweepReport {
        let started = Instant::now();
        let (tx, rx) = mpsc::channel(table.len().max(1));
        for index in 0..table.len() {
            // Capacity equals the item count, so this cannot fail.
            let _ = tx.try_send(index);
        }
        drop(tx);

        let queue = Arc::new(tokio::sync::Mutex::new(rx));
        let mut workers = JoinSet::new();
        for worker_id in 0..self.workers {
            workers.spawn(worker(
                worker_id,
                queue.clone(),
                table.clone(),
                self.registry.clone(),
                self.timeout,
            ));
        }

        let mut report = SweepReport::default();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(partial) => report.merge(partial),
                Err(e) => warn!("[poller] worker panicked: {}", e),
            }
        }

        debug!(
            "[poller] sweep of {} peers done in {:?}: {} ok, {} failed, {} skipped",
            table.len(),
            started.elapsed(),
            report.succeeded,
            report.failed,
            report.skipped
        );
        report
    }

    /// Sweep every registered peer each `interval` until `cancel` fires.
    /// Cancellation also interrupts a sweep in progress.
    ///
    /// `on_sweep` sees the refreshed table and the report after each sweep.
    pub async fn run_heartbeat<F>(&self, interval: Duration, cancel: CancellationToken, mut on_sweep: F)
    where
        F: FnMut(&PeerTable, &SweepReport),
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut table = PeerTable::default();
        info!("[poller] heartbeat every {:?} with {} workers", interval, self.workers);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    table = table.refreshed(self.registry.keys());
                    // Dropping the sweep aborts its workers and their pings.
                    let report = tokio::select! {
                        _ = cancel.cancelled() => break,
                        report = self.sweep(&table) => report,
                    };
                    if let Some(err) = &report.last_error {
                        debug!("[poller] last failure: {}", err);
                    }
                    on_sweep(&table, &report);
                }
            }
        }

        info!("[poller] heartbeat stopped");
    }
}

async fn worker(
    worker_id: usize,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<usize>>>,
    table: PeerTable,
    registry: Arc<SessionRegistry>,
    timeout: Duration,
) -> SweepReport {
    let mut report = SweepReport::default();

    loop {
        let next = queue.lock().await.recv().await;
        let Some(index) = next else { break };
        let Some(hostname) = table.hostname(index) else { continue };

        let Some(session) = registry.get(&hostname) else {
            report.skipped += 1;
            continue;
        };

        report.attempted += 1;
        match session.ping(timeout).await {
            Ok(pong) if !pong.version.is_empty() => {
                table.record_alive(index, pong.version);
                report.succeeded += 1;
            }
            Ok(_) => {
                report.failed += 1;
                report.last_error = Some(format!("{}: empty version", hostname));
            }
            Err(e) => {
                debug!("[poller] worker {} ping {} failed: {}", worker_id, hostname, e);
                if e.is_connection_fatal() {
                    registry.evict(&hostname, &session);
                }
                report.failed += 1;
                report.last_error = Some(format!("{}: {}", hostname, e));
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::Router;
    use crate::session::{Role, Session};
    use crate::transport::Transport;

    fn stale_status(hostname: &str) -> PeerStatus {
        PeerStatus {
            hostname: hostname.into(),
            version: Some("0.9.0".into()),
            alive: true,
            last_seen: DateTime::from_timestamp(1_700_000_000, 0),
        }
    }

    /// Registers a session whose peer never answers. Returns the far ends,
    /// which must stay alive for the sessions to stay open.
    fn register_silent(registry: &SessionRegistry, hostname: &str) -> tokio::io::DuplexStream {
        let (a, b) = tokio::io::duplex(64 * 1024);
        registry
            .get_or_create(hostname, || Ok(Transport::upgraded(a, "mem")))
            .unwrap();
        b
    }

    fn register_serving(registry: &SessionRegistry, hostname: &str) -> Arc<Session> {
        let (a, b) = tokio::io::duplex(64 * 1024);
        registry
            .get_or_create(hostname, || Ok(Transport::upgraded(a, "mem")))
            .unwrap();
        let agent = Arc::new(Session::new(hostname, Transport::upgraded(b, "mem"), Role::Client));
        let serving = agent.clone();
        tokio::spawn(async move { serving.serve(Arc::new(Router::with_ping())).await });
        agent
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_peers_bounded_by_workers() {
        let registry = Arc::new(SessionRegistry::new());
        let hosts = ["h1", "h2", "h3", "h4", "h5"];
        let _far_ends: Vec<_> = hosts.iter().map(|h| register_silent(&registry, h)).collect();

        let table = PeerTable::from_statuses(hosts.iter().map(|h| stale_status(h)));
        let before = table.snapshot();

        let poller = Poller::new(registry, 2, Duration::from_secs(3));
        let started = tokio::time::Instant::now();
        let report = poller.sweep(&table).await;
        let elapsed = started.elapsed();

        // 5 peers over 2 workers is 3 rounds of 3s timeouts.
        assert!(elapsed >= Duration::from_secs(9), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(12), "elapsed {:?}", elapsed);
        assert_eq!(table.snapshot(), before);
        assert_eq!(report.attempted, 5);
        assert_eq!(report.failed, 5);
        assert_eq!(report.succeeded, 0);
        assert!(report.last_error.is_some());
    }

    #[tokio::test]
    async fn test_sweep_updates_live_and_skips_unknown() {
        let registry = Arc::new(SessionRegistry::new());
        let _agents = [
            register_serving(&registry, "nas01"),
            register_serving(&registry, "nas02"),
        ];

        let table = PeerTable::from_statuses(vec![
            PeerStatus::new("nas01"),
            stale_status("gone"),
            PeerStatus::new("nas02"),
        ]);

        let poller = Poller::new(registry, 4, Duration::from_secs(3));
        let report = poller.sweep(&table).await;

        assert_eq!(report.attempted, 2);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.last_error, None);

        let statuses = table.snapshot();
        for index in [0, 2] {
            assert!(statuses[index].alive);
            assert_eq!(statuses[index].version.as_deref(), Some(env!("CARGO_PKG_VERSION")));
            assert!(statuses[index].last_seen.is_some());
        }
        assert_eq!(statuses[1], stale_status("gone"));
    }

    #[tokio::test]
    async fn test_empty_table_and_extra_workers() {
        let poller = Poller::new(Arc::new(SessionRegistry::new()), 8, Duration::from_secs(1));
        assert_eq!(poller.sweep(&PeerTable::default()).await, SweepReport::default());

        let table = PeerTable::new(["a", "b"]);
        let report = poller.sweep(&table).await;
        assert_eq!(report.skipped, 2);
        assert_eq!(report.attempted, 0);
    }

    #[test]
    fn test_refreshed_keeps_known_statuses() {
        let table = PeerTable::from_statuses(vec![stale_status("nas01"), stale_status("old")]);
        let refreshed = table.refreshed(vec!["nas02".into(), "nas01".into(), "nas01".into()]);

        let statuses = refreshed.snapshot();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0], stale_status("nas01"));
        assert_eq!(statuses[1], PeerStatus::new("nas02"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_running_sweep() {
        let registry = Arc::new(SessionRegistry::new());
        let hosts = ["h1", "h2", "h3", "h4", "h5"];
        let _far_ends: Vec<_> = hosts.iter().map(|h| register_silent(&registry, h)).collect();
        let poller = Arc::new(Poller::new(registry, 1, Duration::from_secs(30)));
        let cancel = CancellationToken::new();

        let sweeps = Arc::new(Mutex::new(0usize));
        let task = {
            let poller = poller.clone();
            let cancel = cancel.clone();
            let sweeps = sweeps.clone();
            tokio::spawn(async move {
                poller
                    .run_heartbeat(Duration::from_secs(300), cancel, |_, _| *sweeps.lock() += 1)
                    .await
            })
        };

        // One second into a sweep that would take 150s.
        tokio::time::sleep(Duration::from_secs(1)).await;
        let cancelled_at = tokio::time::Instant::now();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("heartbeat should stop promptly")
            .unwrap();

        assert!(cancelled_at.elapsed() < Duration::from_secs(1));
        assert_eq!(*sweeps.lock(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_ticks_until_cancelled() {
        let registry = Arc::new(SessionRegistry::new());
        let _agent = register_serving(&registry, "nas01");
        let poller = Arc::new(Poller::new(registry, 2, Duration::from_secs(3)));
        let cancel = CancellationToken::new();

        let sweeps = Arc::new(Mutex::new(Vec::new()));
        let task = {
            let poller = poller.clone();
            let cancel = cancel.clone();
            let sweeps = sweeps.clone();
            tokio::spawn(async move {
                poller
                    .run_heartbeat(Duration::from_secs(30), cancel, |table, report| {
                        sweeps.lock().push((table.snapshot(), report.clone()));
                    })
                    .await
            })
        };

        // First tick fires immediately, then at 30s and 60s.
        tokio::time::sleep(Duration::from_secs(61)).await;
        cancel.cancel();
        task.await.unwrap();

        let sweeps = sweeps.lock();
        assert_eq!(sweeps.len(), 3);
        let (table, report) = &sweeps[0];
        assert_eq!(report.succeeded, 1);
        assert!(table[0].alive);
    }
}

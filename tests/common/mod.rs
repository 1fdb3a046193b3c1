//! Shared cluster-bootstrap helpers for the integration tests in this
//! directory. Every test brings up its own cluster on loopback with a
//! fresh block of ports, so tests can run concurrently without binding
//! collisions.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use coronet::config::Config;
use coronet::node::Node;
use coronet::raft::Role;

static NEXT_PORT: AtomicU32 = AtomicU32::new(24000);

/// Reserves `n` consecutive loopback ports for one cluster. Generous
/// stride between allocations so a slow test that leaves a socket in
/// `TIME_WAIT` can't bleed into the next one's range.
fn alloc_ports(n: usize) -> Vec<u16> {
    let start = NEXT_PORT.fetch_add((n as u32) * 8 + 8, Ordering::SeqCst);
    (0..n).map(|i| (start + i as u32) as u16).collect()
}

/// Brings up a cluster of `ids.len()` nodes on `127.0.0.1`, connected
/// to each other, with every timing knob tightened for fast tests
/// (150/300ms election range is the production default and is kept;
/// everything else that would otherwise make a test take tens of
/// seconds is turned down).
pub async fn spawn_cluster(ids: &[&str]) -> Vec<Node> {
    spawn_cluster_with(ids, |_| {}).await
}

pub async fn spawn_cluster_with(ids: &[&str], configure: impl Fn(&mut Config)) -> Vec<Node> {
    let ports = alloc_ports(ids.len());
    let mut configs = Vec::with_capacity(ids.len());
    for (i, id) in ids.iter().enumerate() {
        let mut c = Config::default();
        c.node_id = id.to_string();
        c.listen_host = "127.0.0.1".to_string();
        c.listen_port = ports[i];
        c.peers = ids
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(j, pid)| format!("{pid}@127.0.0.1:{}", ports[j]))
            .collect();

        c.connection_retry_attempts = 50;
        c.connection_retry_delay_ms = 50;
        c.liveness_heartbeat_interval_ms = 100;
        c.failure_detector_timeout_threshold_secs = 0.3;
        c.phi_threshold = 3.0;
        c.deadlock_sweep_interval_secs = 1;
        c.lock_reaper_interval_secs = 1;
        c.queue_retry_sweep_interval_secs = 1;
        c.queue_persistence_enabled = false;
        c.request_timeout_ms = 2000;

        configure(&mut c);
        configs.push(c);
    }

    let nodes: Vec<Node> = configs.into_iter().map(Node::new).collect();
    for n in &nodes {
        n.listen().await.expect("node failed to bind its listen address");
    }
    // connect_peers retries internally, but give every acceptor a
    // moment to be ready before the first connection attempt so the
    // first round doesn't burn through the retry budget for nothing.
    tokio::time::sleep(Duration::from_millis(50)).await;
    for n in &nodes {
        n.connect_peers().await;
    }
    nodes
}

/// Polls every node's status until exactly one reports itself leader,
/// or `within` elapses.
pub async fn wait_for_leader(nodes: &[Node], within: Duration) -> Option<Node> {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        for n in nodes {
            if n.status().await.raft.role == Role::Leader {
                return Some(n.clone());
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Polls `f` until it returns `true` or `within` elapses. Returns
/// whether it converged.
pub async fn wait_until<F, Fut>(within: Duration, mut f: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if f().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

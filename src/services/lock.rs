//! Distributed lock manager.
//!
//! Locks are granted only as a
//! side effect of a committed Raft command (`acquire_lock`/
//! `release_lock`), so every node's view of the lock table converges
//! because it is rebuilt from the same deterministic apply stream. The
//! deadlock detector and expiry reaper run independently on every
//! node rather than only on the leader — the source does the same —
//! which is safe only because both operate by deterministic DFS/clock
//! comparison over state that is itself a deterministic function of
//! the committed log, so every node reaches the same verdict.
//!
//! **(expansion)** Leader forwarding: a non-leader `acquire`/`release`
//! call forwards a `LockRequest`/`LockRelease` wire message to
//! `raft.current_leader()`. The receiving handler never grants a lock
//! directly — it submits the command on the caller's behalf and waits
//! for it to take effect, same as a local call would.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::time::{interval, Instant};
use tracing::{info, warn};

use crate::message::{LockMode, LockRequestData, LockResponseData, Message, MessageType};
use crate::raft::Raft;
use crate::state_machine::Command;
use crate::transport::Transport;
use crate::{unix_timestamp, NodeId};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct LockState {
    lock_type: LockMode,
    holders: HashSet<NodeId>,
    waiters: Vec<(NodeId, LockMode, f64)>,
    created_at: f64,
    expires_at: f64,
}

#[derive(Clone)]
pub struct LockManager {
    inner: Arc<Inner>,
}

struct Inner {
    id: NodeId,
    raft: Raft,
    transport: Transport,
    lock_timeout: Duration,
    locks: RwLock<HashMap<String, LockState>>,
    node_locks: RwLock<HashMap<NodeId, HashSet<String>>>,
    wait_for_graph: RwLock<HashMap<NodeId, HashSet<NodeId>>>,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct LockStatus {
    pub total_locks: usize,
    pub active_holders: usize,
}

impl LockManager {
    pub fn new(id: NodeId, raft: Raft, transport: Transport, lock_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                raft,
                transport,
                lock_timeout,
                locks: RwLock::new(HashMap::new()),
                node_locks: RwLock::new(HashMap::new()),
                wait_for_graph: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn active_locks(&self) -> usize {
        self.inner.locks.read().unwrap().len()
    }

    pub fn status(&self) -> LockStatus {
        let locks = self.inner.locks.read().unwrap();
        LockStatus {
            total_locks: locks.len(),
            active_holders: locks.values().map(|l| l.holders.len()).sum(),
        }
    }

    // ---- public API ----

    pub async fn acquire(&self, lock_id: &str, lock_type: LockMode, timeout: Option<Duration>) -> bool {
        let timeout = timeout.unwrap_or(self.inner.lock_timeout);
        self.acquire_for(lock_id, lock_type, &self.inner.id.clone(), timeout).await
    }

    pub async fn release(&self, lock_id: &str) -> bool {
        self.release_for(lock_id, &self.inner.id.clone()).await
    }

    async fn acquire_for(&self, lock_id: &str, lock_type: LockMode, node_id: &NodeId, timeout: Duration) -> bool {
        info!(%lock_id, ?lock_type, %node_id, "requesting lock");
        let command = acquire_command(lock_id, lock_type, node_id, timeout.as_secs_f64());
        match self.inner.raft.submit_command(command).await {
            Ok(true) => {}
            _ => return self.forward_acquire(lock_id, lock_type, node_id, timeout).await,
        }

        let deadline = Instant::now() + timeout;
        loop {
            if self.is_granted(lock_id, node_id) {
                info!(%lock_id, %node_id, "lock granted");
                return true;
            }
            if Instant::now() >= deadline {
                warn!(%lock_id, %node_id, "lock acquisition timed out");
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn release_for(&self, lock_id: &str, node_id: &NodeId) -> bool {
        info!(%lock_id, %node_id, "releasing lock");
        let command = release_command(lock_id, node_id);
        match self.inner.raft.submit_command(command).await {
            Ok(true) => true,
            _ => self.forward_release(lock_id, node_id).await,
        }
    }

    async fn forward_acquire(&self, lock_id: &str, lock_type: LockMode, node_id: &NodeId, timeout: Duration) -> bool {
        let leader = match self.inner.raft.current_leader() {
            Some(leader) => leader,
            None => {
                warn!(%lock_id, "no known leader to forward lock request to");
                return false;
            }
        };
        let data = LockRequestData {
            lock_id: lock_id.to_string(),
            lock_type,
            node_id: node_id.clone(),
            timeout: timeout.as_secs_f64(),
            timestamp: unix_timestamp(),
        };
        let msg = Message::new(MessageType::LockRequest, self.inner.id.clone(), data);
        match self.inner.transport.send(&leader, msg, Some(timeout)).await {
            Ok(Some(resp)) => resp.parse::<LockResponseData>().map(|d| d.granted).unwrap_or(false),
            _ => false,
        }
    }

    async fn forward_release(&self, lock_id: &str, node_id: &NodeId) -> bool {
        let leader = match self.inner.raft.current_leader() {
            Some(leader) => leader,
            None => return false,
        };
        let data = crate::message::LockReleaseData {
            lock_id: lock_id.to_string(),
            node_id: node_id.clone(),
            timestamp: unix_timestamp(),
        };
        let msg = Message::new(MessageType::LockRelease, self.inner.id.clone(), data);
        match self
            .inner
            .transport
            .send(&leader, msg, Some(self.inner.lock_timeout))
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!(%lock_id, error = %e, "lock release forward failed");
                false
            }
        }
    }

    // ---- wire handlers, registered by the node for incoming forwarded requests ----

    pub async fn handle_wire_request(&self, data: LockRequestData) -> LockResponseData {
        let timeout = Duration::from_secs_f64(data.timeout);
        let granted = self
            .acquire_for(&data.lock_id, data.lock_type, &data.node_id, timeout)
            .await;
        LockResponseData {
            granted,
            lock_id: data.lock_id,
        }
    }

    pub async fn handle_wire_release(&self, data: crate::message::LockReleaseData) -> LockResponseData {
        let released = self.release_for(&data.lock_id, &data.node_id).await;
        LockResponseData {
            granted: released,
            lock_id: data.lock_id,
        }
    }

    fn is_granted(&self, lock_id: &str, node_id: &NodeId) -> bool {
        self.inner
            .locks
            .read()
            .unwrap()
            .get(lock_id)
            .map(|l| l.holders.contains(node_id))
            .unwrap_or(false)
    }

    // ---- applied from the committed Raft log ----

    pub fn apply(&self, command: &Command) {
        match command.op.as_str() {
            "acquire_lock" => {
                if let (Some(lock_id), Some(lock_type), Some(node_id)) = (
                    extra_str(command, "lock_id"),
                    extra_val::<LockMode>(command, "lock_type"),
                    extra_val::<NodeId>(command, "node_id"),
                ) {
                    self.try_grant(&lock_id, node_id, lock_type);
                }
            }
            "release_lock" => {
                if let (Some(lock_id), Some(node_id)) =
                    (extra_str(command, "lock_id"), extra_val::<NodeId>(command, "node_id"))
                {
                    self.release_internal(&lock_id, &node_id);
                }
            }
            _ => {}
        }
    }

    fn try_grant(&self, lock_id: &str, node_id: NodeId, lock_type: LockMode) -> bool {
        let now = unix_timestamp();
        let mut locks = self.inner.locks.write().unwrap();
        let lock = locks.entry(lock_id.to_string()).or_insert_with(|| LockState {
            lock_type,
            holders: HashSet::new(),
            waiters: Vec::new(),
            created_at: now,
            expires_at: now + self.inner.lock_timeout.as_secs_f64(),
        });

        // A requester retrying an acquire it already holds (e.g. its
        // first attempt's local timeout raced the grant) is a no-op,
        // not a fresh conflict against itself.
        if lock.holders.contains(&node_id) {
            drop(locks);
            return true;
        }
        // Same for a requester that is already queued: don't stack a
        // second waiter entry for the same retrying caller.
        if lock.waiters.iter().any(|(waiter, _, _)| waiter == &node_id) {
            return false;
        }

        let granted = if lock.holders.is_empty() {
            lock.holders.insert(node_id.clone());
            lock.lock_type = lock_type;
            true
        } else if lock.lock_type == LockMode::Shared && lock_type == LockMode::Shared {
            lock.holders.insert(node_id.clone());
            true
        } else {
            lock.waiters.push((node_id.clone(), lock_type, now));
            let holders = lock.holders.clone();
            drop(locks);
            self.inner.wait_for_graph.write().unwrap().insert(node_id.clone(), holders);
            self.add_node_lock(&node_id, lock_id);
            return false;
        };

        drop(locks);
        if granted {
            self.add_node_lock(&node_id, lock_id);
            self.inner.wait_for_graph.write().unwrap().remove(&node_id);
        }
        granted
    }

    fn release_internal(&self, lock_id: &str, node_id: &NodeId) {
        let mut locks = self.inner.locks.write().unwrap();
        let should_delete = {
            let lock = match locks.get_mut(lock_id) {
                Some(l) => l,
                None => return,
            };
            lock.holders.remove(node_id);
            if lock.holders.is_empty() && !lock.waiters.is_empty() {
                grant_to_waiters(lock);
            }
            lock.holders.is_empty() && lock.waiters.is_empty()
        };
        if should_delete {
            locks.remove(lock_id);
        }
        drop(locks);
        self.remove_node_lock(node_id, lock_id);
        self.inner.wait_for_graph.write().unwrap().remove(node_id);
    }

    fn add_node_lock(&self, node_id: &NodeId, lock_id: &str) {
        self.inner
            .node_locks
            .write()
            .unwrap()
            .entry(node_id.clone())
            .or_default()
            .insert(lock_id.to_string());
    }

    fn remove_node_lock(&self, node_id: &NodeId, lock_id: &str) {
        let mut node_locks = self.inner.node_locks.write().unwrap();
        if let Some(set) = node_locks.get_mut(node_id) {
            set.remove(lock_id);
            if set.is_empty() {
                node_locks.remove(node_id);
            }
        }
    }

    // ---- background sweeps ----

    pub fn spawn_deadlock_detector(&self, sweep_interval: Duration) -> (tokio::task::JoinHandle<()>, oneshot::Sender<()>) {
        let this = self.clone();
        let (tx, mut rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    _ = ticker.tick() => this.run_deadlock_sweep(),
                }
            }
        });
        (handle, tx)
    }

    pub fn spawn_expiry_reaper(&self, sweep_interval: Duration) -> (tokio::task::JoinHandle<()>, oneshot::Sender<()>) {
        let this = self.clone();
        let (tx, mut rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    _ = ticker.tick() => this.reap_expired(),
                }
            }
        });
        (handle, tx)
    }

    fn run_deadlock_sweep(&self) {
        let cycles = self.detect_deadlocks();
        if cycles.is_empty() {
            return;
        }
        warn!(cycles = cycles.len(), "deadlocks detected");
        for cycle in cycles {
            let victim = match cycle
                .iter()
                .max_by(|a, b| {
                    let wa = self.node_wait_time(a);
                    let wb = self.node_wait_time(b);
                    wa.partial_cmp(&wb).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.cmp(b))
                })
                .cloned()
            {
                Some(v) => v,
                None => continue,
            };
            info!(%victim, "aborting youngest waiter to resolve deadlock");
            let held: Vec<String> = self
                .inner
                .node_locks
                .read()
                .unwrap()
                .get(&victim)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default();
            for lock_id in held {
                self.release_internal(&lock_id, &victim);
            }
        }
    }

    fn node_wait_time(&self, node_id: &NodeId) -> f64 {
        self.inner
            .locks
            .read()
            .unwrap()
            .values()
            .flat_map(|l| l.waiters.iter())
            .filter(|(waiter, _, _)| waiter == node_id)
            .map(|(_, _, ts)| *ts)
            .fold(f64::INFINITY, f64::min)
    }

    fn detect_deadlocks(&self) -> Vec<Vec<NodeId>> {
        let graph = self.inner.wait_for_graph.read().unwrap().clone();
        let mut deadlocks = Vec::new();
        let mut visited = HashSet::new();

        for start in graph.keys() {
            if visited.contains(start) {
                continue;
            }
            let mut rec_stack = HashSet::new();
            let mut path = Vec::new();
            dfs_find_cycle(start, &graph, &mut visited, &mut rec_stack, &mut path, &mut deadlocks);
        }
        deadlocks
    }

    fn reap_expired(&self) {
        let now = unix_timestamp();
        let expired: Vec<String> = self
            .inner
            .locks
            .read()
            .unwrap()
            .iter()
            .filter(|(_, l)| now > l.expires_at)
            .map(|(id, _)| id.clone())
            .collect();
        for lock_id in expired {
            warn!(%lock_id, "lock expired, releasing");
            let holders: Vec<NodeId> = self
                .inner
                .locks
                .read()
                .unwrap()
                .get(&lock_id)
                .map(|l| l.holders.iter().cloned().collect())
                .unwrap_or_default();
            for node_id in holders {
                self.release_internal(&lock_id, &node_id);
            }
            self.inner.locks.write().unwrap().remove(&lock_id);
        }
    }
}

fn grant_to_waiters(lock: &mut LockState) {
    if lock.waiters.is_empty() {
        return;
    }
    let (node_id, lock_type, _) = lock.waiters.remove(0);
    lock.holders.insert(node_id.clone());
    lock.lock_type = lock_type;

    if lock_type == LockMode::Shared {
        let mut remaining = Vec::new();
        for (waiter, waiter_type, ts) in lock.waiters.drain(..) {
            if waiter_type == LockMode::Shared {
                lock.holders.insert(waiter);
            } else {
                remaining.push((waiter, waiter_type, ts));
            }
        }
        lock.waiters = remaining;
    }
}

fn dfs_find_cycle(
    node: &NodeId,
    graph: &HashMap<NodeId, HashSet<NodeId>>,
    visited: &mut HashSet<NodeId>,
    rec_stack: &mut HashSet<NodeId>,
    path: &mut Vec<NodeId>,
    deadlocks: &mut Vec<Vec<NodeId>>,
) -> bool {
    visited.insert(node.clone());
    rec_stack.insert(node.clone());
    path.push(node.clone());

    if let Some(neighbors) = graph.get(node) {
        for neighbor in neighbors {
            if !visited.contains(neighbor) {
                if dfs_find_cycle(neighbor, graph, visited, rec_stack, path, deadlocks) {
                    return true;
                }
            } else if rec_stack.contains(neighbor) {
                let start = path.iter().position(|n| n == neighbor).unwrap_or(0);
                deadlocks.push(path[start..].to_vec());
                return true;
            }
        }
    }

    rec_stack.remove(node);
    path.pop();
    false
}

fn acquire_command(lock_id: &str, lock_type: LockMode, node_id: &NodeId, timeout: f64) -> Command {
    build_command(
        "acquire_lock",
        json!({
            "lock_id": lock_id,
            "lock_type": lock_type,
            "node_id": node_id,
            "timeout": timeout,
            "timestamp": unix_timestamp(),
        }),
    )
}

fn release_command(lock_id: &str, node_id: &NodeId) -> Command {
    build_command(
        "release_lock",
        json!({
            "lock_id": lock_id,
            "node_id": node_id,
            "timestamp": unix_timestamp(),
        }),
    )
}

fn build_command(op: &str, extra: Value) -> Command {
    Command {
        op: op.to_string(),
        key: None,
        value: None,
        extra: extra.as_object().cloned().unwrap_or_default(),
    }
}

fn extra_str(command: &Command, field: &str) -> Option<String> {
    command.extra.get(field)?.as_str().map(|s| s.to_string())
}

fn extra_val<T: for<'de> serde::Deserialize<'de>>(command: &Command, field: &str) -> Option<T> {
    serde_json::from_value(command.extra.get(field)?.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(pairs: &[(&str, &str)]) -> HashMap<NodeId, HashSet<NodeId>> {
        let mut g: HashMap<NodeId, HashSet<NodeId>> = HashMap::new();
        for (from, to) in pairs {
            g.entry(NodeId::new(*from)).or_default().insert(NodeId::new(*to));
        }
        g
    }

    #[test]
    fn detects_simple_two_node_cycle() {
        let g = graph(&[("a", "b"), ("b", "a")]);
        let mut visited = HashSet::new();
        let mut deadlocks = Vec::new();
        for start in g.keys() {
            if visited.contains(start) {
                continue;
            }
            let mut rec_stack = HashSet::new();
            let mut path = Vec::new();
            dfs_find_cycle(start, &g, &mut visited, &mut rec_stack, &mut path, &mut deadlocks);
        }
        assert!(!deadlocks.is_empty());
    }

    #[test]
    fn no_cycle_in_acyclic_chain() {
        let g = graph(&[("a", "b"), ("b", "c")]);
        let mut visited = HashSet::new();
        let mut deadlocks = Vec::new();
        for start in g.keys() {
            if visited.contains(start) {
                continue;
            }
            let mut rec_stack = HashSet::new();
            let mut path = Vec::new();
            dfs_find_cycle(start, &g, &mut visited, &mut rec_stack, &mut path, &mut deadlocks);
        }
        assert!(deadlocks.is_empty());
    }

    #[test]
    fn shared_waiters_all_granted_together() {
        let mut lock = LockState {
            lock_type: LockMode::Exclusive,
            holders: HashSet::new(),
            waiters: vec![
                (NodeId::new("a"), LockMode::Shared, 1.0),
                (NodeId::new("b"), LockMode::Shared, 2.0),
                (NodeId::new("c"), LockMode::Exclusive, 3.0),
            ],
            created_at: 0.0,
            expires_at: 100.0,
        };
        grant_to_waiters(&mut lock);
        assert!(lock.holders.contains(&NodeId::new("a")));
        assert!(lock.holders.contains(&NodeId::new("b")));
        assert_eq!(lock.waiters.len(), 1);
        assert_eq!(lock.waiters[0].0, NodeId::new("c"));
    }
}

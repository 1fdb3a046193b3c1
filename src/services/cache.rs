//! MESI-style write-invalidate distributed cache.
//!
//! Four-state cache
//! lines (Modified/Exclusive/Shared/Invalid), an LRU eviction policy,
//! and a get path that falls back to other nodes' caches and finally
//! the state machine on a miss.
//!
//! **(expansion)** Write-through ordering (resolves Open Question
//! §9.2): `put` submits the `set` command to Raft and installs the
//! local line as `Modified` immediately, but only broadcasts
//! `CACHE_INVALIDATE` to peers after that command has actually
//! committed and been applied — signaled back through a one-shot
//! channel keyed by a token riding alongside the command, resolved
//! from `Node`'s `on_commit` dispatch. This closes the staleness
//! window the source's broadcast-then-write order left open: a peer
//! can no longer observe an invalidation for a write it could still
//! read a stale value for.
//!
//! Non-leader writes are forwarded to the current leader as a
//! `CACHE_PUT` wire request (the receiving node's `put` may itself
//! forward again if it has since lost leadership) rather than
//! silently dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use lru::LruCache;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::debug;

use crate::message::{CacheGetData, CacheGetResponseData, CachePutData, CacheAckData, Message, MessageType};
use crate::raft::Raft;
use crate::state_machine::{Command, StateMachine};
use crate::transport::Transport;
use crate::{new_message_id, unix_timestamp, NodeId};

const BROADCAST_TIMEOUT: Duration = Duration::from_secs(1);
const COMMIT_WAIT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    Modified,
    Exclusive,
    Shared,
    Invalid,
}

impl CacheState {
    fn as_str(self) -> &'static str {
        match self {
            CacheState::Modified => "modified",
            CacheState::Exclusive => "exclusive",
            CacheState::Shared => "shared",
            CacheState::Invalid => "invalid",
        }
    }
}

struct CacheLine {
    value: Value,
    state: CacheState,
    last_access: f64,
    access_count: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct CacheStatus {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<Inner>,
}

struct Inner {
    id: NodeId,
    raft: Raft,
    transport: Transport,
    state_machine: Arc<StateMachine>,
    peers: RwLock<Vec<NodeId>>,
    capacity: usize,
    lines: Mutex<LruCache<String, CacheLine>>,
    pending_commits: RwLock<HashMap<String, oneshot::Sender<()>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheManager {
    pub fn new(
        id: NodeId,
        raft: Raft,
        transport: Transport,
        state_machine: Arc<StateMachine>,
        peers: Vec<NodeId>,
        capacity: usize,
    ) -> Self {
        let capacity_nz = std::num::NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Arc::new(Inner {
                id,
                raft,
                transport,
                state_machine,
                peers: RwLock::new(peers),
                capacity,
                lines: Mutex::new(LruCache::new(capacity_nz)),
                pending_commits: RwLock::new(HashMap::new()),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
        }
    }

    pub fn set_peers(&self, peers: Vec<NodeId>) {
        *self.inner.peers.write().unwrap() = peers;
    }

    pub fn status(&self) -> CacheStatus {
        CacheStatus {
            size: self.inner.lines.lock().unwrap().len(),
            capacity: self.inner.capacity,
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
        }
    }

    // ---- public API ----

    pub async fn get(&self, key: &str) -> Option<Value> {
        if let Some(value) = self.local_hit(key) {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            debug!(%key, "cache hit");
            return Some(value);
        }
        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        debug!(%key, "cache miss");

        let value = self.fetch_from_cluster(key).await;
        if let Some(value) = &value {
            self.install_line(key, value.clone(), CacheState::Shared);
        }
        value
    }

    pub async fn put(&self, key: &str, value: Value) -> bool {
        let token = new_message_id();
        match self.submit_set(key, &value, &token).await {
            Some(rx) => {
                self.install_line(key, value.clone(), CacheState::Modified);
                let _ = tokio::time::timeout(COMMIT_WAIT_TIMEOUT, rx).await;
                self.broadcast_invalidate(key).await;
                true
            }
            None => {
                self.inner.pending_commits.write().unwrap().remove(&token);
                if self.forward_put(key, value.clone()).await {
                    self.install_line(key, value, CacheState::Modified);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub async fn invalidate(&self, key: &str) {
        self.invalidate_local(key);
        self.broadcast_invalidate(key).await;
    }

    // ---- committed-log hook ----

    /// Called by `Node`'s commit dispatcher for every applied command;
    /// resolves the write-through wait for `put` if this command
    /// carries a matching token.
    pub fn notify_committed(&self, command: &Command) {
        if command.op != "set" {
            return;
        }
        if let Some(token) = command.extra.get("cache_token").and_then(Value::as_str) {
            if let Some(tx) = self.inner.pending_commits.write().unwrap().remove(token) {
                let _ = tx.send(());
            }
        }
    }

    // ---- wire handlers ----

    pub fn handle_wire_get(&self, data: CacheGetData) -> CacheGetResponseData {
        let mut lines = self.inner.lines.lock().unwrap();
        if let Some(line) = lines.get_mut(&data.key) {
            if line.state != CacheState::Invalid {
                if line.state == CacheState::Exclusive {
                    line.state = CacheState::Shared;
                }
                return CacheGetResponseData {
                    found: true,
                    value: Some(line.value.clone()),
                    state: Some(line.state.as_str().to_string()),
                };
            }
        }
        CacheGetResponseData {
            found: false,
            value: None,
            state: None,
        }
    }

    pub async fn handle_wire_put(&self, data: CachePutData) -> CacheAckData {
        let applied = self.put(&data.key, data.value.unwrap_or(Value::Null)).await;
        CacheAckData {
            status: if applied { "applied".to_string() } else { "rejected".to_string() },
        }
    }

    pub fn handle_wire_invalidate(&self, data: crate::message::CachePutData) -> CacheAckData {
        self.invalidate_local(&data.key);
        CacheAckData {
            status: "invalidated".to_string(),
        }
    }

    // ---- internals ----

    fn local_hit(&self, key: &str) -> Option<Value> {
        let mut lines = self.inner.lines.lock().unwrap();
        let line = lines.get_mut(key)?;
        if line.state == CacheState::Invalid {
            return None;
        }
        line.last_access = unix_timestamp();
        line.access_count += 1;
        Some(line.value.clone())
    }

    fn install_line(&self, key: &str, value: Value, state: CacheState) {
        let mut lines = self.inner.lines.lock().unwrap();
        let evicted = lines.put(
            key.to_string(),
            CacheLine {
                value,
                state,
                last_access: unix_timestamp(),
                access_count: 0,
            },
        );
        if evicted.is_some() {
            self.inner.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn invalidate_local(&self, key: &str) {
        if let Some(line) = self.inner.lines.lock().unwrap().get_mut(key) {
            line.state = CacheState::Invalid;
        }
    }

    async fn submit_set(&self, key: &str, value: &Value, token: &str) -> Option<oneshot::Receiver<()>> {
        let (tx, rx) = oneshot::channel();
        self.inner.pending_commits.write().unwrap().insert(token.to_string(), tx);

        let command = Command {
            op: "set".to_string(),
            key: Some(key.to_string()),
            value: Some(value.clone()),
            extra: json!({ "cache_token": token }).as_object().cloned().unwrap_or_default(),
        };
        match self.inner.raft.submit_command(command).await {
            Ok(true) => Some(rx),
            _ => None,
        }
    }

    async fn forward_put(&self, key: &str, value: Value) -> bool {
        let leader = match self.inner.raft.current_leader() {
            Some(leader) => leader,
            None => return false,
        };
        let data = CachePutData {
            key: key.to_string(),
            value: Some(value),
        };
        let msg = Message::new(MessageType::CachePut, self.inner.id.clone(), data);
        match self.inner.transport.send(&leader, msg, Some(COMMIT_WAIT_TIMEOUT)).await {
            Ok(Some(resp)) => resp.parse::<CacheAckData>().map(|a| a.status == "applied").unwrap_or(false),
            _ => false,
        }
    }

    async fn fetch_from_cluster(&self, key: &str) -> Option<Value> {
        let peers = self.inner.peers.read().unwrap().clone();
        for peer in peers {
            let data = CacheGetData { key: key.to_string() };
            let msg = Message::new(MessageType::CacheGet, self.inner.id.clone(), data);
            if let Ok(Some(resp)) = self.inner.transport.send(&peer, msg, Some(BROADCAST_TIMEOUT)).await {
                if let Ok(parsed) = resp.parse::<CacheGetResponseData>() {
                    if parsed.found {
                        return parsed.value;
                    }
                }
            }
        }
        self.inner.state_machine.get(key)
    }

    async fn broadcast_invalidate(&self, key: &str) {
        let peers = self.inner.peers.read().unwrap().clone();
        let data = CachePutData {
            key: key.to_string(),
            value: None,
        };
        for peer in peers {
            let msg = Message::new(MessageType::CacheInvalidate, self.inner.id.clone(), data.clone());
            let _ = self.inner.transport.send(&peer, msg, None).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_state_wire_strings_match_source_vocabulary() {
        assert_eq!(CacheState::Modified.as_str(), "modified");
        assert_eq!(CacheState::Exclusive.as_str(), "exclusive");
        assert_eq!(CacheState::Shared.as_str(), "shared");
        assert_eq!(CacheState::Invalid.as_str(), "invalid");
    }
}

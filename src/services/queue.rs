//! Sharded, persistent message queue.
//!
//! Named queues are owned by
//! whichever node a consistent-hash ring (MD5, 150 virtual nodes per
//! physical node) maps the queue name to; a request against a queue
//! this node doesn't own is forwarded once to the owner. Unlike the
//! lock manager, queue state does not ride the Raft log — ownership
//! is a deterministic function of cluster membership, so there is
//! nothing to replicate, only to forward.
//!
//! **(expansion)** Retry keeps the origin queue (resolves Open
//! Question §9.3): each in-flight message remembers the queue name it
//! was dequeued from, and the retry sweep re-enqueues into that same
//! queue instead of an arbitrary one.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};

use crate::message::{DequeueData, DequeueResponseData, EnqueueData, EnqueueResponseData, Message, MessageType, WireQueueMessage};
use crate::transport::Transport;
use crate::{new_message_id, unix_timestamp, NodeId};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// MD5-keyed consistent hash ring, grounded one-to-one on the source's
/// `ConsistentHash`: 150 virtual nodes per physical node, and lookup
/// wraps around to the ring's first entry past the greatest key.
pub struct ConsistentHash {
    virtual_nodes: usize,
    ring: BTreeMap<u128, NodeId>,
}

impl ConsistentHash {
    pub fn new(nodes: impl IntoIterator<Item = NodeId>, virtual_nodes: usize) -> Self {
        let mut ring = Self {
            virtual_nodes,
            ring: BTreeMap::new(),
        };
        for node in nodes {
            ring.add_node(node);
        }
        ring
    }

    fn hash(key: &str) -> u128 {
        let digest = md5::compute(key.as_bytes());
        u128::from_be_bytes(digest.0)
    }

    pub fn add_node(&mut self, node: NodeId) {
        for i in 0..self.virtual_nodes {
            let key = Self::hash(&format!("{}:{}", node.as_str(), i));
            self.ring.insert(key, node.clone());
        }
        info!(%node, virtual_nodes = self.virtual_nodes, "added node to hash ring");
    }

    pub fn remove_node(&mut self, node: &NodeId) {
        for i in 0..self.virtual_nodes {
            let key = Self::hash(&format!("{}:{}", node.as_str(), i));
            self.ring.remove(&key);
        }
    }

    pub fn get_node(&self, key: &str) -> Option<NodeId> {
        if self.ring.is_empty() {
            return None;
        }
        let hash_val = Self::hash(key);
        self.ring
            .range(hash_val..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, node)| node.clone())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct QueueMessage {
    msg_id: String,
    queue_name: String,
    data: Value,
    timestamp: f64,
    retries: u32,
    max_retries: u32,
}

impl QueueMessage {
    fn to_wire(&self) -> WireQueueMessage {
        WireQueueMessage {
            msg_id: self.msg_id.clone(),
            data: self.data.clone(),
            timestamp: self.timestamp,
            retries: self.retries,
            max_retries: self.max_retries,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct QueueStatus {
    pub queue_depth: usize,
    pub in_flight: usize,
    pub dead_letters: usize,
}

#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<Inner>,
}

struct Inner {
    id: NodeId,
    transport: Transport,
    ring: RwLock<ConsistentHash>,
    queues: RwLock<HashMap<String, VecDeque<QueueMessage>>>,
    in_flight: RwLock<HashMap<String, QueueMessage>>,
    dlq: RwLock<HashMap<String, Vec<QueueMessage>>>,
    max_queue_size: usize,
    max_retries: u32,
    in_flight_timeout: Duration,
    persistence_enabled: bool,
    data_dir: PathBuf,
}

impl QueueManager {
    pub fn new(
        id: NodeId,
        transport: Transport,
        cluster_nodes: Vec<NodeId>,
        max_queue_size: usize,
        max_retries: u32,
        in_flight_timeout: Duration,
        persistence_enabled: bool,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        let mut ring_nodes = cluster_nodes;
        if !ring_nodes.contains(&id) {
            ring_nodes.push(id.clone());
        }
        Self {
            inner: Arc::new(Inner {
                id,
                transport,
                ring: RwLock::new(ConsistentHash::new(ring_nodes, 150)),
                queues: RwLock::new(HashMap::new()),
                in_flight: RwLock::new(HashMap::new()),
                dlq: RwLock::new(HashMap::new()),
                max_queue_size,
                max_retries,
                in_flight_timeout,
                persistence_enabled,
                data_dir: data_dir.into(),
            }),
        }
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            queue_depth: self.inner.queues.read().unwrap().values().map(|q| q.len()).sum(),
            in_flight: self.inner.in_flight.read().unwrap().len(),
            dead_letters: self.inner.dlq.read().unwrap().values().map(|v| v.len()).sum(),
        }
    }

    // ---- public API ----

    pub async fn enqueue(&self, queue_name: &str, data: Value) -> bool {
        let owner = self.inner.ring.read().unwrap().get_node(queue_name);
        let message = QueueMessage {
            msg_id: format!("{}_{}", self.inner.id, new_message_id()),
            queue_name: queue_name.to_string(),
            data,
            timestamp: unix_timestamp(),
            retries: 0,
            max_retries: self.inner.max_retries,
        };
        match owner {
            Some(ref owner) if *owner == self.inner.id => self.enqueue_local(message).await,
            Some(owner) => self.forward_enqueue(&owner, message).await,
            None => false,
        }
    }

    pub async fn dequeue(&self, queue_name: &str, timeout: Duration) -> Option<(String, Value, f64)> {
        let owner = self.inner.ring.read().unwrap().get_node(queue_name);
        match owner {
            Some(ref owner) if *owner == self.inner.id => self.dequeue_local(queue_name, timeout).await,
            Some(owner) => self.forward_dequeue(&owner, queue_name, timeout).await,
            None => None,
        }
    }

    pub async fn acknowledge(&self, msg_id: &str) -> bool {
        let removed = self.inner.in_flight.write().unwrap().remove(msg_id);
        if removed.is_some() {
            if self.inner.persistence_enabled {
                self.remove_persisted(msg_id).await;
            }
            debug!(%msg_id, "acknowledged message");
            true
        } else {
            false
        }
    }

    async fn enqueue_local(&self, message: QueueMessage) -> bool {
        let full = {
            let mut queues = self.inner.queues.write().unwrap();
            let queue = queues.entry(message.queue_name.clone()).or_default();
            if queue.len() >= self.inner.max_queue_size {
                true
            } else {
                queue.push_back(message.clone());
                false
            }
        };
        if full {
            warn!(queue_name = %message.queue_name, "queue is full");
            return false;
        }
        if self.inner.persistence_enabled {
            self.persist(&message).await;
        }
        debug!(msg_id = %message.msg_id, queue_name = %message.queue_name, "enqueued message");
        true
    }

    async fn dequeue_local(&self, queue_name: &str, timeout: Duration) -> Option<(String, Value, f64)> {
        let deadline = Instant::now() + timeout;
        loop {
            let popped = self.inner.queues.write().unwrap().get_mut(queue_name).and_then(|q| q.pop_front());
            if let Some(message) = popped {
                let result = (message.msg_id.clone(), message.data.clone(), message.timestamp);
                self.inner.in_flight.write().unwrap().insert(message.msg_id.clone(), message);
                return Some(result);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn forward_enqueue(&self, owner: &NodeId, message: QueueMessage) -> bool {
        let data = EnqueueData {
            queue_name: message.queue_name.clone(),
            message: message.to_wire(),
        };
        let msg = Message::new(MessageType::Enqueue, self.inner.id.clone(), data);
        match self.inner.transport.send(owner, msg, Some(Duration::from_secs(5))).await {
            Ok(Some(resp)) => resp.parse::<EnqueueResponseData>().map(|d| d.success).unwrap_or(false),
            _ => false,
        }
    }

    async fn forward_dequeue(&self, owner: &NodeId, queue_name: &str, timeout: Duration) -> Option<(String, Value, f64)> {
        let data = DequeueData {
            queue_name: queue_name.to_string(),
            timeout: timeout.as_secs_f64(),
        };
        let msg = Message::new(MessageType::Dequeue, self.inner.id.clone(), data);
        match self
            .inner
            .transport
            .send(owner, msg, Some(timeout + Duration::from_secs(1)))
            .await
        {
            Ok(Some(resp)) => resp.parse::<DequeueResponseData>().ok().and_then(|d| {
                d.message.map(|m| (m.msg_id, m.data, m.timestamp))
            }),
            _ => None,
        }
    }

    // ---- wire handlers ----

    pub async fn handle_wire_enqueue(&self, data: EnqueueData) -> EnqueueResponseData {
        let message = QueueMessage {
            msg_id: data.message.msg_id.clone(),
            queue_name: data.queue_name,
            data: data.message.data,
            timestamp: data.message.timestamp,
            retries: data.message.retries,
            max_retries: data.message.max_retries,
        };
        let msg_id = message.msg_id.clone();
        let success = self.enqueue_local(message).await;
        EnqueueResponseData { success, msg_id }
    }

    pub async fn handle_wire_dequeue(&self, data: DequeueData) -> DequeueResponseData {
        let timeout = Duration::from_secs_f64(data.timeout.max(0.0));
        let message = self
            .dequeue_local(&data.queue_name, timeout)
            .await
            .map(|(msg_id, value, timestamp)| WireQueueMessage {
                msg_id,
                data: value,
                timestamp,
                retries: 0,
                max_retries: self.inner.max_retries,
            });
        DequeueResponseData { message }
    }

    // ---- retry sweep ----

    pub fn spawn_retry_sweep(&self, sweep_interval: Duration) -> (tokio::task::JoinHandle<()>, oneshot::Sender<()>) {
        let this = self.clone();
        let (tx, mut rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    _ = ticker.tick() => this.retry_sweep().await,
                }
            }
        });
        (handle, tx)
    }

    async fn retry_sweep(&self) {
        let now = unix_timestamp();
        let timed_out: Vec<QueueMessage> = {
            let mut in_flight = self.inner.in_flight.write().unwrap();
            let expired_ids: Vec<String> = in_flight
                .iter()
                .filter(|(_, m)| now - m.timestamp > self.inner.in_flight_timeout.as_secs_f64())
                .map(|(id, _)| id.clone())
                .collect();
            expired_ids.into_iter().filter_map(|id| in_flight.remove(&id)).collect()
        };

        for mut message in timed_out {
            if message.retries < message.max_retries {
                message.retries += 1;
                info!(msg_id = %message.msg_id, retries = message.retries, "retrying message");
                let queue_name = message.queue_name.clone();
                self.inner
                    .queues
                    .write()
                    .unwrap()
                    .entry(queue_name)
                    .or_default()
                    .push_back(message);
            } else {
                warn!(msg_id = %message.msg_id, retries = message.retries, "moving message to dead letter queue");
                self.inner
                    .dlq
                    .write()
                    .unwrap()
                    .entry(message.queue_name.clone())
                    .or_default()
                    .push(message);
            }
        }
    }

    // ---- persistence ----

    fn persist_path(&self, message: &QueueMessage) -> PathBuf {
        self.inner
            .data_dir
            .join(format!("queue_{}_{}.json", message.queue_name, message.msg_id))
    }

    async fn persist(&self, message: &QueueMessage) {
        if let Err(e) = tokio::fs::create_dir_all(&self.inner.data_dir).await {
            warn!(error = %e, "failed to create queue data directory");
            return;
        }
        let path = self.persist_path(message);
        match serde_json::to_vec(message) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&path, bytes).await {
                    warn!(error = %e, path = %path.display(), "failed to persist queue message");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize queue message"),
        }
    }

    async fn remove_persisted(&self, msg_id: &str) {
        let mut dir = match tokio::fs::read_dir(&self.inner.data_dir).await {
            Ok(dir) => dir,
            Err(_) => return,
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("queue_") && name.ends_with(&format!("{}.json", msg_id)) {
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
    }

    /// Reloads persisted messages into their origin queues at startup.
    pub async fn load_persisted(&self) {
        if !self.inner.persistence_enabled {
            return;
        }
        let mut dir = match tokio::fs::read_dir(&self.inner.data_dir).await {
            Ok(dir) => dir,
            Err(_) => return,
        };
        let mut loaded = 0usize;
        while let Ok(Some(entry)) = dir.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = match tokio::fs::read(&path).await {
                Ok(b) => b,
                Err(_) => continue,
            };
            if let Ok(message) = serde_json::from_slice::<QueueMessage>(&bytes) {
                self.inner
                    .queues
                    .write()
                    .unwrap()
                    .entry(message.queue_name.clone())
                    .or_default()
                    .push_back(message);
                loaded += 1;
            }
        }
        if loaded > 0 {
            info!(loaded, "loaded persisted queue messages");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_assigns_consistently() {
        let nodes = vec![NodeId::new("a"), NodeId::new("b"), NodeId::new("c")];
        let ring = ConsistentHash::new(nodes, 150);
        let first = ring.get_node("orders");
        let second = ring.get_node("orders");
        assert_eq!(first, second);
        assert!(first.is_some());
    }

    #[test]
    fn ring_spreads_keys_across_nodes() {
        let nodes = vec![NodeId::new("a"), NodeId::new("b"), NodeId::new("c")];
        let ring = ConsistentHash::new(nodes, 150);
        let assigned: std::collections::HashSet<_> = (0..50)
            .map(|i| ring.get_node(&format!("queue-{i}")).unwrap())
            .collect();
        assert!(assigned.len() > 1);
    }

    #[test]
    fn removing_a_node_redistributes_its_keys() {
        let mut ring = ConsistentHash::new(vec![NodeId::new("a"), NodeId::new("b")], 150);
        let before: Vec<_> = (0..20).map(|i| ring.get_node(&format!("q{i}"))).collect();
        ring.remove_node(&NodeId::new("b"));
        let after: Vec<_> = (0..20).map(|i| ring.get_node(&format!("q{i}"))).collect();
        assert!(after.iter().all(|n| n.as_ref() == Some(&NodeId::new("a"))));
        assert_ne!(before, after);
    }
}

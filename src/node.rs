//! `Node`: wires the transport, the failure detector, the Raft core
//! and the three services together into one runnable cluster member.
//!
//! Owns exactly this set of collaborators and exposes a matching set
//! of operations (`get`/`set`, `acquire_lock`/`release_lock`,
//! `enqueue`/`dequeue`, `status`).
//! The one construction wrinkle:
//! `Raft::spawn` needs its `on_commit` callback before the lock
//! manager and cache manager exist (both take the `Raft` handle that
//! `spawn` returns), and both of those need to be reachable from
//! `on_commit`. Two `OnceLock` cells close the loop — `on_commit`
//! reads through them and is a no-op for the brief window before
//! they're set, which ends before any command could possibly commit
//! (nothing submits a command until `Node::spawn` returns).

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::failure_detector::FailureDetector;
use crate::message::{
    AppendEntriesData, AppendEntriesResponseData, CacheGetData, CachePutData, DequeueData, EnqueueData,
    HeartbeatData, LockMode, LockReleaseData, LockRequestData, Message, MessageType, RequestVoteData, StatusData,
};
use crate::failure_detector::FailureDetectorStatus;
use crate::metrics::NodeStatus;
use crate::raft::{MemStorage, Raft, Storage};
use crate::services::{CacheManager, LockManager, QueueManager};
use crate::state_machine::{Command, StateMachine};
use crate::transport::Transport;
use crate::NodeId;

/// One running cluster member. Cheap to clone — every field is
/// already `Clone` over an `Arc`, matching `Raft`/`Transport`'s
/// handle-clone convention — so a clone can be handed to background
/// tasks without a wrapping `Arc<Node>`.
#[derive(Clone)]
pub struct Node {
    id: NodeId,
    config: Arc<Config>,
    transport: Transport,
    raft: Raft,
    state_machine: Arc<StateMachine>,
    lock_manager: LockManager,
    queue_manager: QueueManager,
    cache_manager: CacheManager,
    failure_detector: FailureDetector,
    shutdown: Arc<std::sync::Mutex<Vec<oneshot::Sender<()>>>>,
}

impl Node {
    /// Builds every collaborator, registers wire handlers, and spawns
    /// all background tasks (Raft is already running once this
    /// returns; `connect_peers`/`listen` are left to the caller since
    /// they require I/O that may reasonably fail at startup).
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let id = config.id();
        let peers: Vec<NodeId> = config.peer_addrs().into_iter().map(|(id, _)| id).collect();

        let transport = Transport::new(
            id.clone(),
            config.connection_retry_attempts,
            Duration::from_millis(config.connection_retry_delay_ms),
        );
        let state_machine = Arc::new(StateMachine::new());
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());

        let lock_cell: Arc<OnceLock<LockManager>> = Arc::new(OnceLock::new());
        let cache_cell: Arc<OnceLock<CacheManager>> = Arc::new(OnceLock::new());

        let on_commit = {
            let state_machine = state_machine.clone();
            let lock_cell = lock_cell.clone();
            let cache_cell = cache_cell.clone();
            Arc::new(move |command: &Command| {
                state_machine.apply(command);
                if let Some(lm) = lock_cell.get() {
                    lm.apply(command);
                }
                if let Some(cm) = cache_cell.get() {
                    cm.notify_committed(command);
                }
            })
        };

        let (raft, raft_shutdown) = Raft::spawn(
            id.clone(),
            config.clone(),
            transport.clone(),
            storage,
            on_commit,
            peers.clone(),
        );

        let lock_manager = LockManager::new(id.clone(), raft.clone(), transport.clone(), config.lock_timeout());
        lock_cell.set(lock_manager.clone()).ok();

        let cache_manager = CacheManager::new(
            id.clone(),
            raft.clone(),
            transport.clone(),
            state_machine.clone(),
            peers.clone(),
            config.cache_capacity,
        );
        cache_cell.set(cache_manager.clone()).ok();

        let queue_manager = QueueManager::new(
            id.clone(),
            transport.clone(),
            peers.clone(),
            config.queue_capacity,
            config.queue_max_retries,
            Duration::from_secs(config.queue_in_flight_timeout_secs),
            config.queue_persistence_enabled,
            config.queue_data_dir.clone(),
        );

        let failure_detector = FailureDetector::new(
            id.clone(),
            Duration::from_millis(config.liveness_heartbeat_interval_ms),
            config.failure_detector_timeout_threshold_secs,
            config.phi_threshold,
            config.failure_detector_window,
        );
        for peer in &peers {
            failure_detector.register_node(peer.clone());
        }

        let node = Self {
            id,
            config,
            transport,
            raft,
            state_machine,
            lock_manager,
            queue_manager,
            cache_manager,
            failure_detector,
            shutdown: Arc::new(std::sync::Mutex::new(vec![raft_shutdown])),
        };

        node.register_handlers();
        node.spawn_background_tasks();
        node
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    // ---- startup I/O, left for the caller to sequence and report errors from ----

    pub async fn listen(&self) -> Result<()> {
        let addr = self.config.listen_addr().map_err(|e| Error::InvalidListenAddr {
            addr: format!("{}:{}", self.config.listen_host, self.config.listen_port),
            source: e,
        })?;
        self.transport.listen(addr).await.map_err(Error::from)
    }

    /// Connects to every configured peer. Individual failures are
    /// logged, not fatal — the failure detector and reconnection on a
    /// later command will surface a peer that never comes up.
    pub async fn connect_peers(&self) {
        for (peer, addr) in self.config.peer_addrs() {
            if let Err(e) = self.transport.connect(peer.clone(), &addr).await {
                warn!(%peer, error = %e, "failed to connect to peer at startup");
            }
        }
        self.queue_manager.load_persisted().await;
    }

    // ---- public operations, mirroring BaseNode's surface ----

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.cache_manager.get(key).await
    }

    pub async fn set(&self, key: &str, value: Value) -> bool {
        self.cache_manager.put(key, value).await
    }

    pub async fn acquire_lock(&self, lock_id: &str, lock_type: LockMode, timeout: Option<Duration>) -> bool {
        self.lock_manager.acquire(lock_id, lock_type, timeout).await
    }

    pub async fn release_lock(&self, lock_id: &str) -> bool {
        self.lock_manager.release(lock_id).await
    }

    pub async fn enqueue(&self, queue_name: &str, data: Value) -> bool {
        self.queue_manager.enqueue(queue_name, data).await
    }

    pub async fn dequeue(&self, queue_name: &str, timeout: Duration) -> Option<(String, Value, f64)> {
        self.queue_manager.dequeue(queue_name, timeout).await
    }

    pub async fn acknowledge(&self, msg_id: &str) -> bool {
        self.queue_manager.acknowledge(msg_id).await
    }

    /// The committed value stored under `key`, bypassing the cache
    /// entirely. Lets a caller tell a cache hit apart from what the
    /// replicated log actually agreed on.
    pub fn state_machine_value(&self, key: &str) -> Option<Value> {
        self.state_machine.get(key)
    }

    /// Snapshot of this node's view of every other node's liveness.
    pub fn failure_detector_status(&self) -> FailureDetectorStatus {
        self.failure_detector.status()
    }

    /// Broadcasts one liveness heartbeat immediately, outside the
    /// periodic ticker in `spawn_background_tasks`. The periodic task
    /// calls the same transport path; this just exposes it for a
    /// caller that wants to announce liveness right away instead of
    /// waiting for the next tick (e.g. just after reconnecting).
    pub async fn send_heartbeat(&self) {
        let msg = Message::new(MessageType::Heartbeat, self.id.clone(), HeartbeatData { timestamp: crate::unix_timestamp() });
        self.transport.broadcast(msg, &[]).await;
    }

    pub async fn status(&self) -> NodeStatus {
        let raft = self.raft.metrics().borrow().clone();
        let cache = self.cache_manager.status();
        let queue = self.queue_manager.status();
        NodeStatus {
            raft,
            connected_peers: self.transport.connected_peers().await,
            state_machine_size: self.state_machine.len(),
            active_locks: self.lock_manager.active_locks(),
            queue_depth: queue.queue_depth,
            in_flight: queue.in_flight,
            dead_letters: queue.dead_letters,
            cache_size: cache.size,
            cache_hits: cache.hits,
            cache_misses: cache.misses,
        }
    }

    /// Releases every background task's shutdown sender. Tasks whose
    /// receiver has already been dropped (it never will be, since
    /// `Node` holds the only clone) are a silent no-op.
    pub fn shutdown(&self) {
        for tx in self.shutdown.lock().unwrap().drain(..) {
            let _ = tx.send(());
        }
    }

    // ---- wiring ----

    fn register_handlers(&self) {
        let raft = self.raft.clone();
        self.transport.register_handler(MessageType::RequestVote, move |msg| {
            let raft = raft.clone();
            async move {
                let data: RequestVoteData = msg.parse()?;
                let resp = raft.request_vote(data).await?;
                Ok(serde_json::to_value(resp)?)
            }
        });

        let raft = self.raft.clone();
        self.transport.register_handler(MessageType::AppendEntries, move |msg| {
            let raft = raft.clone();
            async move {
                let data: AppendEntriesData = msg.parse()?;
                let resp: AppendEntriesResponseData = raft.append_entries(data).await?;
                Ok(serde_json::to_value(resp)?)
            }
        });

        let lock_manager = self.lock_manager.clone();
        self.transport.register_handler(MessageType::LockRequest, move |msg| {
            let lock_manager = lock_manager.clone();
            async move {
                let data: LockRequestData = msg.parse()?;
                let resp = lock_manager.handle_wire_request(data).await;
                Ok(serde_json::to_value(resp)?)
            }
        });

        let lock_manager = self.lock_manager.clone();
        self.transport.register_handler(MessageType::LockRelease, move |msg| {
            let lock_manager = lock_manager.clone();
            async move {
                let data: LockReleaseData = msg.parse()?;
                let resp = lock_manager.handle_wire_release(data).await;
                Ok(serde_json::to_value(resp)?)
            }
        });

        let queue_manager = self.queue_manager.clone();
        self.transport.register_handler(MessageType::Enqueue, move |msg| {
            let queue_manager = queue_manager.clone();
            async move {
                let data: EnqueueData = msg.parse()?;
                let resp = queue_manager.handle_wire_enqueue(data).await;
                Ok(serde_json::to_value(resp)?)
            }
        });

        let queue_manager = self.queue_manager.clone();
        self.transport.register_handler(MessageType::Dequeue, move |msg| {
            let queue_manager = queue_manager.clone();
            async move {
                let data: DequeueData = msg.parse()?;
                let resp = queue_manager.handle_wire_dequeue(data).await;
                Ok(serde_json::to_value(resp)?)
            }
        });

        let cache_manager = self.cache_manager.clone();
        self.transport.register_handler(MessageType::CacheGet, move |msg| {
            let cache_manager = cache_manager.clone();
            async move {
                let data: CacheGetData = msg.parse()?;
                let resp = cache_manager.handle_wire_get(data);
                Ok(serde_json::to_value(resp)?)
            }
        });

        let cache_manager = self.cache_manager.clone();
        self.transport.register_handler(MessageType::CachePut, move |msg| {
            let cache_manager = cache_manager.clone();
            async move {
                let data: CachePutData = msg.parse()?;
                let resp = cache_manager.handle_wire_put(data).await;
                Ok(serde_json::to_value(resp)?)
            }
        });

        let cache_manager = self.cache_manager.clone();
        self.transport.register_handler(MessageType::CacheInvalidate, move |msg| {
            let cache_manager = cache_manager.clone();
            async move {
                let data: CachePutData = msg.parse()?;
                let resp = cache_manager.handle_wire_invalidate(data);
                Ok(serde_json::to_value(resp)?)
            }
        });

        let failure_detector = self.failure_detector.clone();
        self.transport.register_handler(MessageType::Heartbeat, move |msg| {
            let failure_detector = failure_detector.clone();
            async move {
                let _data: HeartbeatData = msg.parse()?;
                failure_detector.receive_heartbeat(&msg.sender);
                Ok(serde_json::to_value(HeartbeatData { timestamp: crate::unix_timestamp() })?)
            }
        });

        // No handler for `HeartbeatResponse` on purpose: registering one
        // here, even a no-op, means `handle_inbound` still builds and
        // sends a reply to it — which itself arrives as another
        // `HeartbeatResponse` at the peer, forever. Response-class
        // frames (`Pong`, `VoteResponse`, ... and this one) are left
        // unhandled; `handle_inbound` drops them with a warning instead.

        let id = self.id.clone();
        let raft = self.raft.clone();
        self.transport.register_handler(MessageType::Ping, move |_msg| {
            let id = id.clone();
            let raft = raft.clone();
            async move {
                Ok(serde_json::to_value(StatusData {
                    status: "ok".to_string(),
                    node_id: Some(id),
                    role: Some(format!("{:?}", raft.current_role()).to_lowercase()),
                })?)
            }
        });
    }

    /// Spawns the failure detector monitor, the lock manager's
    /// deadlock/expiry sweeps, the queue's retry sweep, and a generic
    /// liveness heartbeat broadcast distinct from Raft's
    /// heartbeat-as-replication (Raft's heartbeats only ever reach a
    /// node that is also a Raft peer and say nothing about the queue
    /// or cache services living alongside it; a node that is not
    /// currently part of the Raft membership, or a client deployment
    /// that only talks to the queue, still needs liveness tracking).
    fn spawn_background_tasks(&self) {
        let mut shutdowns = Vec::new();

        let (_, tx) = self.failure_detector.spawn_monitor(
            {
                let id = self.id.clone();
                Arc::new(move |node_id: NodeId| warn!(%id, %node_id, "peer marked failed"))
            },
            {
                let id = self.id.clone();
                Arc::new(move |node_id: NodeId| info!(%id, %node_id, "peer recovered"))
            },
        );
        shutdowns.push(tx);

        let (_, tx) = self
            .lock_manager
            .spawn_deadlock_detector(Duration::from_secs(self.config.deadlock_sweep_interval_secs));
        shutdowns.push(tx);

        let (_, tx) = self
            .lock_manager
            .spawn_expiry_reaper(Duration::from_secs(self.config.lock_reaper_interval_secs));
        shutdowns.push(tx);

        let (_, tx) = self
            .queue_manager
            .spawn_retry_sweep(Duration::from_secs(self.config.queue_retry_sweep_interval_secs));
        shutdowns.push(tx);

        let (tx_hb, mut rx_hb) = oneshot::channel();
        let transport = self.transport.clone();
        let sender = self.id.clone();
        let interval = Duration::from_millis(self.config.liveness_heartbeat_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = &mut rx_hb => break,
                    _ = ticker.tick() => {
                        let msg = Message::new(
                            MessageType::Heartbeat,
                            sender.clone(),
                            HeartbeatData { timestamp: crate::unix_timestamp() },
                        );
                        transport.broadcast(msg, &[]).await;
                    }
                }
            }
        });
        shutdowns.push(tx_hb);

        self.shutdown.lock().unwrap().extend(shutdowns);
    }
}

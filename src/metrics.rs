//! Node-wide status snapshot, published over a `watch` channel.
//!
//! Follows the same pattern `raft.rs`'s own metrics channel uses:
//! rather than exposing mutable internals directly, each subsystem
//! publishes a cheap, clonable snapshot that callers (tests, an
//! eventual external exporter) can `watch()` or poll. This is
//! intentionally not a Prometheus exporter — that belongs to an
//! external metrics-exporter collaborator, out of this core's scope.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::raft::Role;
use crate::NodeId;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RaftMetrics {
    pub id: NodeId,
    pub role: Role,
    pub current_term: u64,
    pub current_leader: Option<NodeId>,
    pub last_log_index: u64,
    pub commit_index: u64,
    pub last_applied: u64,
}

impl RaftMetrics {
    pub fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            role: Role::Follower,
            current_term: 0,
            current_leader: None,
            last_log_index: 0,
            commit_index: 0,
            last_applied: 0,
        }
    }
}

pub fn watch_channel(initial: RaftMetrics) -> (watch::Sender<RaftMetrics>, watch::Receiver<RaftMetrics>) {
    watch::channel(initial)
}

/// A broader point-in-time view of one node, combining Raft metrics
/// with the sizes of the three services layered on top of it, in a
/// single struct rather than four ad hoc status objects.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NodeStatus {
    pub raft: RaftMetrics,
    pub connected_peers: usize,
    pub state_machine_size: usize,
    pub active_locks: usize,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub dead_letters: usize,
    pub cache_size: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

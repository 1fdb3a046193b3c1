//! Core Raft data types: log entries and the follower/candidate/leader
//! role. Kept separate from `core.rs` the way
//! `raft.rs`'s public types from `core/mod.rs`'s engine.

use serde::{Deserialize, Serialize};

use crate::message::WireLogEntry;
use crate::state_machine::Command;
use crate::NodeId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// A single entry in the replicated log. Entries are append-only:
/// only an uncommitted tail may ever be truncated.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub command: Command,
    pub timestamp: f64,
}

impl LogEntry {
    pub fn to_wire(&self) -> WireLogEntry {
        WireLogEntry {
            term: self.term,
            index: self.index,
            command: serde_json::to_value(&self.command).unwrap_or(serde_json::Value::Null),
            timestamp: self.timestamp,
        }
    }

    pub fn from_wire(wire: &WireLogEntry) -> serde_json::Result<Self> {
        Ok(Self {
            term: wire.term,
            index: wire.index,
            command: serde_json::from_value(wire.command.clone())?,
            timestamp: wire.timestamp,
        })
    }
}

/// A leader's own view of a peer's response to one AppendEntries RPC;
/// fed back into the core loop over an internal channel so replicating
/// to N peers concurrently never blocks the core from handling other
/// work: the core must stay responsive to incoming RPCs with a higher
/// term even while a heartbeat round is in flight.
#[derive(Clone, Debug)]
pub struct ReplicationOutcome {
    pub peer: NodeId,
    pub term: u64,
    pub success: bool,
    /// `prev_log_index + entries.len()` at the time the RPC was sent,
    /// used to advance `match_index` only if still applicable.
    pub sent_prev_log_index: i64,
    pub entries_len: u64,
}

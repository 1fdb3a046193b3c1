//! `coronet` is a single-process node in a small distributed
//! coordination cluster. Each node runs a Raft consensus core and
//! three services layered on top of it: a distributed lock manager, a
//! sharded persistent message queue, and a write-invalidate cache
//! modeled on MESI. Nodes talk to each other over a length-prefixed,
//! JSON-framed transport and watch one another with a φ-accrual
//! failure detector.

pub mod config;
pub mod error;
pub mod failure_detector;
pub mod message;
pub mod metrics;
pub mod node;
pub mod raft;
pub mod services;
pub mod state_machine;
pub mod transport;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};

/// A cluster-unique node identifier. Opaque to every subsystem except
/// for equality and ordering (used as a `BTreeMap`/`HashMap` key and,
/// for deadlock tie-breaks, as a total order).
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Seconds since the Unix epoch, as carried on the wire. Using `f64`
/// matches the wire contract's `<number, seconds>` timestamp fields.
pub fn unix_timestamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Generates a cluster-unique message id for an outbound `Message`.
pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

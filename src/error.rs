//! Crate-wide error types.
//!
//! Each subsystem gets its own error enum so that a failure can be
//! attributed to the layer it occurred in without leaking transport
//! plumbing into Raft, or Raft plumbing into the lock manager. `Error`
//! is the union used at the node's public surface.

use thiserror::Error;

use crate::NodeId;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("no connection established to node {0}")]
    ConnectionDown(NodeId),

    #[error("timed out waiting for a response to message {0}")]
    ResponseTimeout(String),

    #[error("received a frame with an unknown msg_type: {0}")]
    UnknownMessageType(String),

    #[error("handler for {msg_type} raised an error: {source}")]
    HandlerRaised {
        msg_type: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("frame did not decode as valid JSON: {0}")]
    CorruptFrame(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("this node is not the leader")]
    NotLeader,

    #[error("the Raft core has shut down")]
    ShuttingDown,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type RaftResult<T> = Result<T, RaftError>;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("lock request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("this node is not the leader and no leader is currently known")]
    NoKnownLeader,

    #[error(transparent)]
    Raft(#[from] RaftError),
}

pub type LockResult<T> = Result<T, LockError>;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue {0} is full")]
    QueueFull(String),

    #[error("no response from the owning node for queue {0}")]
    OwnerUnreachable(String),

    #[error(transparent)]
    Raft(#[from] RaftError),
}

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache miss for {key} and no peer or state machine has a value")]
    MissAndNoPeer { key: String },

    #[error(transparent)]
    Raft(#[from] RaftError),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Top level error, used where a caller needs to handle failures from
/// more than one subsystem (e.g. node startup).
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Raft(#[from] RaftError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("failed to bind listener on {addr}: {source}")]
    ListenBind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("configured listen address \"{addr}\" does not parse as host:port: {source}")]
    InvalidListenAddr {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;

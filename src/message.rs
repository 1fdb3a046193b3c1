//! The wire message envelope and per-`msg_type` payload shapes.
//!
//! The envelope is bit-exact with the contract: a `msg_type` enum tag,
//! the sending `NodeId`, an opaque `data` object, a `msg_id` used to
//! correlate requests and responses, and a `timestamp` in seconds.
//! Re-implementers are expected to parse `data` into a typed variant
//! at the transport boundary rather than passing a loose JSON map
//! around; `Message::typed_data`/`Message::with_payload` do that.

use serde::{Deserialize, Serialize};

use crate::{new_message_id, unix_timestamp, NodeId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    RequestVote,
    VoteResponse,
    AppendEntries,
    AppendEntriesResponse,
    LockRequest,
    LockRelease,
    LockResponse,
    Enqueue,
    Dequeue,
    QueueResponse,
    CacheGet,
    CachePut,
    CacheInvalidate,
    CacheResponse,
    Heartbeat,
    HeartbeatResponse,
    Ping,
    Pong,
}

impl MessageType {
    /// The `msg_type` this message is a reply to, used by handlers
    /// that must answer with the matching response tag.
    pub fn response_type(self) -> MessageType {
        use MessageType::*;
        match self {
            RequestVote => VoteResponse,
            AppendEntries => AppendEntriesResponse,
            LockRequest | LockRelease => LockResponse,
            Enqueue | Dequeue => QueueResponse,
            CacheGet | CachePut | CacheInvalidate => CacheResponse,
            Heartbeat => HeartbeatResponse,
            Ping => Pong,
            other => other,
        }
    }
}

/// A message exchanged between nodes. `data` is kept as a
/// `serde_json::Value` at the envelope level (matching the wire
/// contract's untyped `data` object) but every handler immediately
/// parses it into one of the structs below via `serde_json::from_value`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub msg_type: MessageType,
    pub sender: NodeId,
    pub data: serde_json::Value,
    pub msg_id: String,
    pub timestamp: f64,
}

impl Message {
    pub fn new(msg_type: MessageType, sender: NodeId, data: impl Serialize) -> Self {
        Self {
            msg_type,
            sender,
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
            msg_id: new_message_id(),
            timestamp: unix_timestamp(),
        }
    }

    /// Builds a response message that echoes the request's `msg_id`
    /// so the sender's pending-response table resolves it.
    pub fn respond(&self, sender: NodeId, data: impl Serialize) -> Self {
        Self {
            msg_type: self.msg_type.response_type(),
            sender,
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
            msg_id: self.msg_id.clone(),
            timestamp: unix_timestamp(),
        }
    }

    pub fn parse<T: for<'de> Deserialize<'de>>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.data.clone())
    }
}

// ---- Raft payloads ----

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteData {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: i64,
    pub last_log_term: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteResponseData {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireLogEntry {
    pub term: u64,
    pub index: u64,
    pub command: serde_json::Value,
    pub timestamp: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesData {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: i64,
    pub prev_log_term: u64,
    pub entries: Vec<WireLogEntry>,
    pub leader_commit: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponseData {
    pub term: u64,
    pub success: bool,
}

// ---- Liveness payloads ----

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatData {
    pub timestamp: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusData {
    pub status: String,
    pub node_id: Option<NodeId>,
    pub role: Option<String>,
}

// ---- Lock payloads ----

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockRequestData {
    pub lock_id: String,
    pub lock_type: LockMode,
    pub node_id: NodeId,
    pub timeout: f64,
    pub timestamp: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockReleaseData {
    pub lock_id: String,
    pub node_id: NodeId,
    pub timestamp: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockResponseData {
    pub granted: bool,
    pub lock_id: String,
}

// ---- Queue payloads ----

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireQueueMessage {
    pub msg_id: String,
    pub data: serde_json::Value,
    pub timestamp: f64,
    pub retries: u32,
    pub max_retries: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnqueueData {
    pub queue_name: String,
    pub message: WireQueueMessage,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnqueueResponseData {
    pub success: bool,
    pub msg_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DequeueData {
    pub queue_name: String,
    pub timeout: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DequeueResponseData {
    pub message: Option<WireQueueMessage>,
}

// ---- Cache payloads ----

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheGetData {
    pub key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheGetResponseData {
    pub found: bool,
    pub value: Option<serde_json::Value>,
    pub state: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CachePutData {
    pub key: String,
    pub value: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheAckData {
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_round_trips_through_json() {
        let msg = Message::new(
            MessageType::RequestVote,
            NodeId::new("node1"),
            RequestVoteData {
                term: 4,
                candidate_id: NodeId::new("node1"),
                last_log_index: 9,
                last_log_term: 3,
            },
        );
        let encoded = serde_json::to_vec(&msg).unwrap();
        let decoded: Message = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.msg_id, msg.msg_id);
        assert_eq!(decoded.sender, msg.sender);
        assert_eq!(decoded.timestamp, msg.timestamp);
        let data: RequestVoteData = decoded.parse().unwrap();
        assert_eq!(data.term, 4);
        assert_eq!(data.last_log_index, 9);
    }

    #[test]
    fn respond_echoes_msg_id_and_flips_type() {
        let req = Message::new(
            MessageType::LockRequest,
            NodeId::new("a"),
            LockRequestData {
                lock_id: "L".into(),
                lock_type: LockMode::Exclusive,
                node_id: NodeId::new("a"),
                timeout: 30.0,
                timestamp: 0.0,
            },
        );
        let resp = req.respond(
            NodeId::new("b"),
            LockResponseData {
                granted: true,
                lock_id: "L".into(),
            },
        );
        assert_eq!(resp.msg_id, req.msg_id);
        assert_eq!(resp.msg_type, MessageType::LockResponse);
    }
}

//! Public surface of the Raft subsystem: a cheaply-clonable `Raft`
//! handle over the `RaftCore` actor, mirroring the split
//! between `raft.rs` (the handle callers hold) and `core/mod.rs` (the
//! task that owns all mutable state).

pub mod core;
pub mod storage;
pub mod types;

pub use self::core::{OnCommit, RaftMsg};
pub use storage::{HardState, MemStorage, Storage};
pub use types::{LogEntry, ReplicationOutcome, Role};

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};

use crate::config::Config;
use crate::error::RaftError;
use crate::message::{AppendEntriesData, AppendEntriesResponseData, RequestVoteData, VoteResponseData};
use crate::metrics::{watch_channel, RaftMetrics};
use crate::transport::Transport;
use crate::state_machine::Command;
use crate::NodeId;

/// A handle to a running `RaftCore`. Clones share the same underlying
/// actor; dropping every handle (and the shutdown sender returned by
/// `spawn`) lets the core's task exit.
#[derive(Clone)]
pub struct Raft {
    tx_api: mpsc::UnboundedSender<RaftMsg>,
    rx_metrics: watch::Receiver<RaftMetrics>,
}

impl Raft {
    /// Spawns the core actor and returns the handle plus a one-shot
    /// sender that requests a clean shutdown when fired.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        id: NodeId,
        config: Arc<Config>,
        transport: Transport,
        storage: Arc<dyn Storage>,
        on_commit: OnCommit,
        peers: Vec<NodeId>,
    ) -> (Self, oneshot::Sender<()>) {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch_channel(RaftMetrics::new_initial(id.clone()));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();

        self::core::RaftCore::spawn(
            id,
            config,
            transport,
            storage,
            on_commit,
            peers,
            rx_api,
            tx_metrics,
            rx_shutdown,
        );

        (Self { tx_api, rx_metrics }, tx_shutdown)
    }

    pub async fn append_entries(&self, rpc: AppendEntriesData) -> Result<AppendEntriesResponseData, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.tx_api
            .send(RaftMsg::AppendEntries { rpc, tx })
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    pub async fn request_vote(&self, rpc: RequestVoteData) -> Result<VoteResponseData, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.tx_api
            .send(RaftMsg::RequestVote { rpc, tx })
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    /// Submits a command to the replicated log. Returns `Ok(true)` if
    /// this node is the leader and accepted the entry, `Ok(false)` if
    /// it is not the leader (callers forward to `current_leader()`).
    pub async fn submit_command(&self, command: Command) -> Result<bool, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.tx_api
            .send(RaftMsg::SubmitCommand { command, tx })
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.rx_metrics.clone()
    }

    pub fn current_leader(&self) -> Option<NodeId> {
        self.rx_metrics.borrow().current_leader.clone()
    }

    pub fn current_role(&self) -> Role {
        self.rx_metrics.borrow().role
    }

    pub fn is_leader(&self) -> bool {
        self.current_role() == Role::Leader
    }
}

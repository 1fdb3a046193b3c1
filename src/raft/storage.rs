//! The Raft storage boundary.
//!
//! Scoped down from a full `RaftStorage` trait (no snapshotting,
//! no log compaction — both are out of scope here):
//! this only covers what §6's failure-semantics requirement demands —
//! the current term, the vote record, and the log tail must survive a
//! crash. A trait boundary exists so a durable backing store can be
//! swapped in later; only the in-memory implementation ships here.

use async_trait::async_trait;

use crate::raft::types::LogEntry;
use crate::NodeId;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
}

#[async_trait]
pub trait Storage: Send + Sync + 'static {
    async fn load_hard_state(&self) -> anyhow::Result<HardState>;
    async fn save_hard_state(&self, state: &HardState) -> anyhow::Result<()>;

    async fn load_log(&self) -> anyhow::Result<Vec<LogEntry>>;
    /// Persists the full log tail. Called after every append/truncate;
    /// for the in-memory store this is a no-op beyond holding the
    /// entries, but a durable implementation would fsync an append-only
    /// segment file here.
    async fn save_log(&self, entries: &[LogEntry]) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct MemStorage {
    inner: tokio::sync::Mutex<MemState>,
}

#[derive(Default)]
struct MemState {
    hard_state: HardState,
    log: Vec<LogEntry>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemStorage {
    async fn load_hard_state(&self) -> anyhow::Result<HardState> {
        Ok(self.inner.lock().await.hard_state.clone())
    }

    async fn save_hard_state(&self, state: &HardState) -> anyhow::Result<()> {
        self.inner.lock().await.hard_state = state.clone();
        Ok(())
    }

    async fn load_log(&self) -> anyhow::Result<Vec<LogEntry>> {
        Ok(self.inner.lock().await.log.clone())
    }

    async fn save_log(&self, entries: &[LogEntry]) -> anyhow::Result<()> {
        self.inner.lock().await.log = entries.to_vec();
        Ok(())
    }
}

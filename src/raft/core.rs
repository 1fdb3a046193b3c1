//! The Raft core actor: the single task that owns all Raft state and
//! drives leader election, log replication, commit advancement and
//! the apply loop. A dedicated
//! task reached only through channels — `rx_api` for commands and
//! RPCs arriving through the transport, `tx_metrics` for the
//! published snapshot) but scoped down: no snapshotting, no dynamic
//! membership (both explicit Non-goals), so there is one combined
//! state struct and loop instead of per-role state machines.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, sleep_until, Instant};
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::message::{
    AppendEntriesData, AppendEntriesResponseData, Message, MessageType, RequestVoteData, VoteResponseData,
};
use crate::metrics::RaftMetrics;
use crate::raft::storage::{HardState, Storage};
use crate::raft::types::{LogEntry, ReplicationOutcome, Role};
use crate::state_machine::Command;
use crate::transport::Transport;
use crate::{unix_timestamp, NodeId};

pub type OnCommit = Arc<dyn Fn(&Command) + Send + Sync>;

pub enum RaftMsg {
    AppendEntries {
        rpc: AppendEntriesData,
        tx: oneshot::Sender<AppendEntriesResponseData>,
    },
    RequestVote {
        rpc: RequestVoteData,
        tx: oneshot::Sender<VoteResponseData>,
    },
    SubmitCommand {
        command: Command,
        tx: oneshot::Sender<bool>,
    },
}

struct ElectionOutcome {
    term: u64,
    votes: usize,
    max_term_seen: u64,
}

pub struct RaftCore {
    id: NodeId,
    config: Arc<Config>,
    transport: Transport,
    storage: Arc<dyn Storage>,
    on_commit: OnCommit,
    peers: Vec<NodeId>,

    role: Role,
    current_term: u64,
    voted_for: Option<NodeId>,
    current_leader: Option<NodeId>,
    log: Vec<LogEntry>,
    commit_index: i64,
    last_applied: i64,

    next_index: HashMap<NodeId, u64>,
    match_index: HashMap<NodeId, u64>,

    election_deadline: Instant,

    rx_api: mpsc::UnboundedReceiver<RaftMsg>,
    tx_metrics: watch::Sender<RaftMetrics>,
    rx_shutdown: oneshot::Receiver<()>,

    tx_repl: mpsc::UnboundedSender<ReplicationOutcome>,
    rx_repl: mpsc::UnboundedReceiver<ReplicationOutcome>,
    tx_election: mpsc::UnboundedSender<ElectionOutcome>,
    rx_election: mpsc::UnboundedReceiver<ElectionOutcome>,
}

impl RaftCore {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        id: NodeId,
        config: Arc<Config>,
        transport: Transport,
        storage: Arc<dyn Storage>,
        on_commit: OnCommit,
        peers: Vec<NodeId>,
        rx_api: mpsc::UnboundedReceiver<RaftMsg>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let (tx_repl, rx_repl) = mpsc::unbounded_channel();
        let (tx_election, rx_election) = mpsc::unbounded_channel();
        let this = Self {
            id,
            config,
            transport,
            storage,
            on_commit,
            peers,
            role: Role::Follower,
            current_term: 0,
            voted_for: None,
            current_leader: None,
            log: Vec::new(),
            commit_index: -1,
            last_applied: -1,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            election_deadline: Instant::now(),
            rx_api,
            tx_metrics,
            rx_shutdown,
            tx_repl,
            rx_repl,
            tx_election,
            rx_election,
        };
        tokio::spawn(this.run())
    }

    #[instrument(level = "debug", skip(self), fields(id = %self.id))]
    async fn run(mut self) {
        if let Ok(hs) = self.storage.load_hard_state().await {
            self.current_term = hs.current_term;
            self.voted_for = hs.voted_for;
        }
        if let Ok(log) = self.storage.load_log().await {
            self.log = log;
        }
        self.reset_election_timer();

        let mut heartbeat_ticker = interval(self.config.heartbeat_interval());

        loop {
            tokio::select! {
                biased;

                _ = &mut self.rx_shutdown => {
                    info!("raft core shutting down");
                    break;
                }

                maybe_msg = self.rx_api.recv() => {
                    match maybe_msg {
                        Some(msg) => self.handle_api_msg(msg).await,
                        None => break,
                    }
                }

                Some(outcome) = self.rx_repl.recv() => {
                    self.handle_replication_outcome(outcome);
                }

                Some(outcome) = self.rx_election.recv() => {
                    self.handle_election_outcome(outcome);
                }

                _ = sleep_until(self.election_deadline), if self.role != Role::Leader => {
                    self.start_election();
                }

                _ = heartbeat_ticker.tick(), if self.role == Role::Leader => {
                    self.send_heartbeats();
                }
            }

            self.apply_committed();
            self.publish_metrics();
        }
    }

    // ---- shared helpers ----

    fn last_log_index(&self) -> i64 {
        self.log.len() as i64 - 1
    }

    fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    fn reset_election_timer(&mut self) {
        let (min, max) = self.config.election_timeout_range();
        let millis = rand::thread_rng().gen_range(min.as_millis() as u64..=max.as_millis() as u64);
        self.election_deadline = Instant::now() + Duration::from_millis(millis);
    }

    async fn persist_hard_state(&self) {
        let hs = HardState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
        };
        if let Err(e) = self.storage.save_hard_state(&hs).await {
            warn!(error = %e, "failed to persist hard state");
        }
    }

    async fn persist_log(&self) {
        if let Err(e) = self.storage.save_log(&self.log).await {
            warn!(error = %e, "failed to persist log");
        }
    }

    fn publish_metrics(&self) {
        let metrics = RaftMetrics {
            id: self.id.clone(),
            role: self.role,
            current_term: self.current_term,
            current_leader: self.current_leader.clone(),
            last_log_index: self.last_log_index().max(0) as u64,
            commit_index: self.commit_index.max(0) as u64,
            last_applied: self.last_applied.max(0) as u64,
        };
        let _ = self.tx_metrics.send(metrics);
    }

    // ---- public-surface handlers ----

    async fn handle_api_msg(&mut self, msg: RaftMsg) {
        match msg {
            RaftMsg::RequestVote { rpc, tx } => {
                let resp = self.handle_request_vote(rpc).await;
                let _ = tx.send(resp);
            }
            RaftMsg::AppendEntries { rpc, tx } => {
                let resp = self.handle_append_entries(rpc).await;
                let _ = tx.send(resp);
            }
            RaftMsg::SubmitCommand { command, tx } => {
                let accepted = self.submit_command(command).await;
                let _ = tx.send(accepted);
            }
        }
    }

    async fn handle_request_vote(&mut self, req: RequestVoteData) -> VoteResponseData {
        if req.term > self.current_term {
            self.current_term = req.term;
            self.voted_for = None;
            self.role = Role::Follower;
            self.persist_hard_state().await;
        }

        let mut granted = false;
        if req.term >= self.current_term {
            let can_vote = self.voted_for.is_none() || self.voted_for.as_ref() == Some(&req.candidate_id);
            let log_ok = req.last_log_term > self.last_log_term()
                || (req.last_log_term == self.last_log_term() && req.last_log_index >= self.last_log_index());
            if can_vote && log_ok {
                self.voted_for = Some(req.candidate_id.clone());
                self.persist_hard_state().await;
                self.reset_election_timer();
                granted = true;
            }
        }

        debug!(candidate = %req.candidate_id, term = req.term, granted, "request_vote decision");
        VoteResponseData {
            term: self.current_term,
            vote_granted: granted,
        }
    }

    async fn handle_append_entries(&mut self, req: AppendEntriesData) -> AppendEntriesResponseData {
        if req.term < self.current_term {
            return AppendEntriesResponseData {
                term: self.current_term,
                success: false,
            };
        }

        if req.term > self.current_term {
            self.current_term = req.term;
            self.voted_for = None;
            self.persist_hard_state().await;
        }
        self.role = Role::Follower;
        self.current_leader = Some(req.leader_id.clone());
        self.reset_election_timer();

        if req.prev_log_index >= 0 {
            let idx = req.prev_log_index as usize;
            match self.log.get(idx) {
                Some(entry) if entry.term == req.prev_log_term => {}
                _ => {
                    return AppendEntriesResponseData {
                        term: self.current_term,
                        success: false,
                    }
                }
            }
        }

        if !req.entries.is_empty() {
            self.log.truncate((req.prev_log_index + 1) as usize);
            for wire in &req.entries {
                match LogEntry::from_wire(wire) {
                    Ok(entry) => self.log.push(entry),
                    Err(e) => warn!(error = %e, "dropping undecodable log entry"),
                }
            }
            self.persist_log().await;
        }

        if req.leader_commit > self.commit_index {
            self.commit_index = req.leader_commit.min(self.last_log_index());
        }

        AppendEntriesResponseData {
            term: self.current_term,
            success: true,
        }
    }

    async fn submit_command(&mut self, command: Command) -> bool {
        if self.role != Role::Leader {
            return false;
        }
        let entry = LogEntry {
            term: self.current_term,
            index: self.log.len() as u64,
            command,
            timestamp: unix_timestamp(),
        };
        self.log.push(entry);
        self.persist_log().await;
        true
    }

    pub fn current_leader(&self) -> Option<NodeId> {
        self.current_leader.clone()
    }

    // ---- apply loop ----

    fn apply_committed(&mut self) {
        while self.last_applied < self.commit_index {
            self.last_applied += 1;
            let entry = self.log[self.last_applied as usize].clone();
            (self.on_commit)(&entry.command);
        }
    }

    // ---- elections ----

    fn start_election(&mut self) {
        self.role = Role::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id.clone());
        self.reset_election_timer();
        info!(term = self.current_term, "starting election");

        let term = self.current_term;
        let candidate_id = self.id.clone();
        let last_log_index = self.last_log_index();
        let last_log_term = self.last_log_term();
        let peers = self.peers.clone();
        let transport = self.transport.clone();
        let timeout = self.config.election_timeout_range().0;
        let storage = self.storage.clone();
        let tx_election = self.tx_election.clone();

        tokio::spawn(async move {
            let _ = storage
                .save_hard_state(&HardState {
                    current_term: term,
                    voted_for: Some(candidate_id.clone()),
                })
                .await;

            let mut futs = Vec::with_capacity(peers.len());
            for peer in peers {
                let transport = transport.clone();
                let candidate_id = candidate_id.clone();
                futs.push(async move {
                    let data = RequestVoteData {
                        term,
                        candidate_id: candidate_id.clone(),
                        last_log_index,
                        last_log_term,
                    };
                    let msg = Message::new(MessageType::RequestVote, candidate_id, data);
                    transport.send(&peer, msg, Some(timeout)).await
                });
            }

            let results = futures::future::join_all(futs).await;
            let mut votes = 1usize; // vote for self
            let mut max_term_seen = term;
            for result in results {
                if let Ok(Some(response)) = result {
                    if let Ok(data) = response.parse::<VoteResponseData>() {
                        max_term_seen = max_term_seen.max(data.term);
                        if data.vote_granted {
                            votes += 1;
                        }
                    }
                }
            }

            let _ = tx_election.send(ElectionOutcome {
                term,
                votes,
                max_term_seen,
            });
        });
    }

    fn handle_election_outcome(&mut self, outcome: ElectionOutcome) {
        if outcome.max_term_seen > self.current_term {
            self.current_term = outcome.max_term_seen;
            self.voted_for = None;
            self.role = Role::Follower;
            self.current_leader = None;
            return;
        }
        if self.role != Role::Candidate || self.current_term != outcome.term {
            return; // stale result from a superseded election
        }
        let cluster_size = self.peers.len() + 1;
        let needed = cluster_size / 2 + 1;
        if outcome.votes >= needed {
            self.become_leader();
        } else {
            info!(votes = outcome.votes, needed, "election lost, remaining candidate");
        }
    }

    fn become_leader(&mut self) {
        info!(term = self.current_term, "became leader");
        self.role = Role::Leader;
        self.current_leader = Some(self.id.clone());
        let next = self.log.len() as u64;
        for peer in self.peers.clone() {
            self.next_index.insert(peer.clone(), next);
            self.match_index.insert(peer, 0);
        }
        self.send_heartbeats();
    }

    // ---- replication ----

    fn send_heartbeats(&mut self) {
        for peer in self.peers.clone() {
            let next_index = *self.next_index.get(&peer).unwrap_or(&(self.log.len() as u64));
            let prev_log_index = next_index as i64 - 1;
            let prev_log_term = if prev_log_index >= 0 {
                self.log.get(prev_log_index as usize).map(|e| e.term).unwrap_or(0)
            } else {
                0
            };
            let entries: Vec<_> = self.log[(next_index as usize).min(self.log.len())..]
                .iter()
                .map(LogEntry::to_wire)
                .collect();
            let entries_len = entries.len() as u64;

            let data = AppendEntriesData {
                term: self.current_term,
                leader_id: self.id.clone(),
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.commit_index,
            };
            let msg = Message::new(MessageType::AppendEntries, self.id.clone(), data);
            let transport = self.transport.clone();
            let timeout = self.config.heartbeat_interval();
            let tx_repl = self.tx_repl.clone();
            let term_sent = self.current_term;

            tokio::spawn(async move {
                let result = transport.send(&peer, msg, Some(timeout)).await;
                if let Ok(Some(response)) = result {
                    if let Ok(data) = response.parse::<AppendEntriesResponseData>() {
                        let _ = tx_repl.send(ReplicationOutcome {
                            peer,
                            term: data.term,
                            success: data.success,
                            sent_prev_log_index: prev_log_index,
                            entries_len,
                        });
                        return;
                    }
                }
                // Timeout or transport failure: treat as a soft
                // failure, not a log mismatch — don't decrement
                // next_index, just retry on the next heartbeat.
                let _ = tx_repl.send(ReplicationOutcome {
                    peer,
                    term: term_sent,
                    success: false,
                    sent_prev_log_index: -2, // sentinel: never matches, see handle_replication_outcome
                    entries_len: 0,
                });
            });
        }
    }

    fn handle_replication_outcome(&mut self, outcome: ReplicationOutcome) {
        if outcome.term > self.current_term {
            self.current_term = outcome.term;
            self.voted_for = None;
            self.role = Role::Follower;
            self.current_leader = None;
            return;
        }
        if self.role != Role::Leader {
            return;
        }
        if outcome.sent_prev_log_index == -2 {
            return; // unreachable/timeout, nothing to update
        }
        if outcome.success {
            let new_match = (outcome.sent_prev_log_index + outcome.entries_len as i64).max(0) as u64;
            let match_entry = self.match_index.entry(outcome.peer.clone()).or_insert(0);
            if new_match > *match_entry {
                *match_entry = new_match;
            }
            self.next_index.insert(outcome.peer, new_match + 1);
        } else if let Some(next) = self.next_index.get_mut(&outcome.peer) {
            *next = next.saturating_sub(1);
        }
        self.advance_commit_index();
    }

    fn advance_commit_index(&mut self) {
        if self.role != Role::Leader {
            return;
        }
        let mut indices: Vec<u64> = self.match_index.values().cloned().collect();
        indices.push(self.last_log_index().max(0) as u64);
        indices.sort_unstable_by(|a, b| b.cmp(a));
        let majority_idx = indices.len() / 2;
        let candidate = match indices.get(majority_idx) {
            Some(v) => *v,
            None => return,
        };
        if candidate as i64 > self.commit_index {
            if let Some(entry) = self.log.get(candidate as usize) {
                if entry.term == self.current_term {
                    self.commit_index = candidate as i64;
                }
            }
        }
    }
}

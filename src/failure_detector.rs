//! The φ-accrual failure detector.
//!
//! Uses a watch-channel-driven monitor task for
//! its task/callback shape. The algorithm itself: a sliding window of
//! heartbeat inter-arrival times feeds a per-peer mean/variance, and
//! the time since the last heartbeat is scored against that
//! distribution rather than a fixed timeout. The one deliberate
//! departure from the source is the φ formula itself (REDESIGN FLAG
//! item 4): instead of the source's ad hoc
//! `-log10(1 - (elapsed - mean) / (stddev * sqrt(2)))`, which is not a
//! probability and can go negative or produce nonsense near
//! `elapsed == mean`, this computes the actual tail probability under
//! a normal distribution via the standard normal CDF and takes
//! `-log10` of that. The CDF itself has no closed form, so it is
//! evaluated through the Abramowitz–Stegun rational approximation of
//! `erf` (formula 7.1.26), accurate to within 1.5e-7 — easily good
//! enough at the phi thresholds in play here (4.0 / 8.0).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::{interval, Instant};
use tracing::{info, instrument, warn};

use crate::NodeId;

const MIN_STD_DEV: f64 = 0.1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Unknown,
    Alive,
    Suspected,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FailureDetectorStatus {
    pub node_id: NodeId,
    pub monitored_nodes: usize,
    pub alive_nodes: usize,
    pub failed_nodes: usize,
    pub node_states: HashMap<NodeId, NodeState>,
}

struct PeerState {
    state: NodeState,
    last_heartbeat: Instant,
    history: VecDeque<f64>,
}

pub type FailureCallback = Arc<dyn Fn(NodeId) + Send + Sync>;

/// Adaptive, per-peer failure detector. Cheap to clone: state lives
/// behind an `Arc`, so every clone observes and updates the same
/// tables.
#[derive(Clone)]
pub struct FailureDetector {
    inner: Arc<Inner>,
}

struct Inner {
    id: NodeId,
    heartbeat_interval: Duration,
    timeout_threshold: f64,
    phi_threshold: f64,
    history_cap: usize,
    peers: RwLock<HashMap<NodeId, PeerState>>,
}

impl FailureDetector {
    pub fn new(
        id: NodeId,
        heartbeat_interval: Duration,
        timeout_threshold: f64,
        phi_threshold: f64,
        history_cap: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                heartbeat_interval,
                timeout_threshold,
                phi_threshold,
                history_cap: history_cap.max(2),
                peers: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn register_node(&self, node_id: NodeId) {
        let mut peers = self.inner.peers.write().unwrap();
        peers.entry(node_id.clone()).or_insert_with(|| {
            info!(%node_id, "registered node for failure detection");
            PeerState {
                state: NodeState::Unknown,
                last_heartbeat: Instant::now(),
                history: VecDeque::new(),
            }
        });
    }

    pub fn unregister_node(&self, node_id: &NodeId) {
        self.inner.peers.write().unwrap().remove(node_id);
    }

    /// Records an arrival and flips the peer back to `Alive`. Returns
    /// `true` if the peer had been `Failed` (so the caller can fire a
    /// recovery notification without holding the lock itself).
    pub fn receive_heartbeat(&self, node_id: &NodeId) -> bool {
        let now = Instant::now();
        let mut peers = self.inner.peers.write().unwrap();
        let peer = peers.entry(node_id.clone()).or_insert_with(|| PeerState {
            state: NodeState::Unknown,
            last_heartbeat: now,
            history: VecDeque::new(),
        });

        let interval = now.saturating_duration_since(peer.last_heartbeat).as_secs_f64();
        peer.history.push_back(interval);
        if peer.history.len() > self.inner.history_cap {
            peer.history.pop_front();
        }
        peer.last_heartbeat = now;

        let was_failed = peer.state == NodeState::Failed;
        peer.state = NodeState::Alive;
        was_failed
    }

    /// The current suspicion level for a peer: higher means more
    /// likely to have failed. `f64::INFINITY` for an unknown peer.
    pub fn calculate_phi(&self, node_id: &NodeId) -> f64 {
        let peers = self.inner.peers.read().unwrap();
        let peer = match peers.get(node_id) {
            Some(p) => p,
            None => return f64::INFINITY,
        };
        let elapsed = Instant::now().saturating_duration_since(peer.last_heartbeat).as_secs_f64();
        phi_from_history(elapsed, &peer.history, self.inner.timeout_threshold)
    }

    pub fn is_node_alive(&self, node_id: &NodeId) -> bool {
        matches!(
            self.inner.peers.read().unwrap().get(node_id).map(|p| p.state),
            Some(NodeState::Alive)
        )
    }

    pub fn is_node_failed(&self, node_id: &NodeId) -> bool {
        matches!(
            self.inner.peers.read().unwrap().get(node_id).map(|p| p.state),
            Some(NodeState::Failed)
        )
    }

    pub fn alive_nodes(&self) -> Vec<NodeId> {
        self.inner
            .peers
            .read()
            .unwrap()
            .iter()
            .filter(|(_, p)| p.state == NodeState::Alive)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn failed_nodes(&self) -> Vec<NodeId> {
        self.inner
            .peers
            .read()
            .unwrap()
            .iter()
            .filter(|(_, p)| p.state == NodeState::Failed)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn status(&self) -> FailureDetectorStatus {
        let peers = self.inner.peers.read().unwrap();
        let node_states = peers.iter().map(|(id, p)| (id.clone(), p.state)).collect();
        FailureDetectorStatus {
            node_id: self.inner.id.clone(),
            monitored_nodes: peers.len(),
            alive_nodes: peers.values().filter(|p| p.state == NodeState::Alive).count(),
            failed_nodes: peers.values().filter(|p| p.state == NodeState::Failed).count(),
            node_states,
        }
    }

    /// Spawns the monitor loop: every `heartbeat_interval`, recompute
    /// φ for every registered peer (except self) and fire
    /// `on_failed`/`on_recovered` on state transitions.
    pub fn spawn_monitor(
        &self,
        on_failed: FailureCallback,
        on_recovered: FailureCallback,
    ) -> (tokio::task::JoinHandle<()>, oneshot::Sender<()>) {
        let this = self.clone();
        let (tx_shutdown, mut rx_shutdown) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(this.inner.heartbeat_interval);
            loop {
                tokio::select! {
                    _ = &mut rx_shutdown => break,
                    _ = ticker.tick() => this.tick(&on_failed, &on_recovered),
                }
            }
        });
        (handle, tx_shutdown)
    }

    #[instrument(level = "debug", skip_all, fields(id = %self.inner.id))]
    fn tick(&self, on_failed: &FailureCallback, on_recovered: &FailureCallback) {
        let transitions: Vec<(NodeId, NodeState, NodeState)> = {
            let mut peers = self.inner.peers.write().unwrap();
            let mut out = Vec::new();
            for (node_id, peer) in peers.iter_mut() {
                if *node_id == self.inner.id {
                    continue;
                }
                let elapsed = Instant::now().saturating_duration_since(peer.last_heartbeat).as_secs_f64();
                let phi = phi_from_history(elapsed, &peer.history, self.inner.timeout_threshold);
                let new_state = if phi >= self.inner.phi_threshold {
                    NodeState::Failed
                } else if phi >= self.inner.phi_threshold * 0.5 {
                    NodeState::Suspected
                } else {
                    NodeState::Alive
                };
                if new_state != peer.state {
                    out.push((node_id.clone(), peer.state, new_state));
                    peer.state = new_state;
                }
            }
            out
        };

        for (node_id, old, new) in transitions {
            warn!(%node_id, ?old, ?new, "node state changed");
            if new == NodeState::Failed {
                on_failed(node_id);
            } else if old == NodeState::Failed && new == NodeState::Alive {
                on_recovered(node_id);
            }
        }
    }
}

fn phi_from_history(elapsed: f64, history: &VecDeque<f64>, timeout_threshold: f64) -> f64 {
    if history.len() < 2 {
        return elapsed / timeout_threshold;
    }

    let n = history.len() as f64;
    let mean = history.iter().sum::<f64>() / n;
    let variance = history.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt().max(MIN_STD_DEV);

    let p_later = 1.0 - normal_cdf(elapsed, mean, std_dev);
    let p_later = p_later.max(1e-10);
    (-p_later.log10()).max(0.0)
}

fn normal_cdf(x: f64, mean: f64, std_dev: f64) -> f64 {
    let z = (x - mean) / (std_dev * std::f64::consts::SQRT_2);
    0.5 * (1.0 + erf(z))
}

/// Abramowitz & Stegun formula 7.1.26, max error ~1.5e-7.
fn erf(x: f64) -> f64 {
    const A1: f64 = 0.254829592;
    const A2: f64 = -0.284496736;
    const A3: f64 = 1.421413741;
    const A4: f64 = -1.453152027;
    const A5: f64 = 1.061405429;
    const P: f64 = 0.3275911;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let poly = ((((A5 * t + A4) * t + A3) * t + A2) * t + A1) * t;
    sign * (1.0 - poly * (-x * x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_peer_is_infinitely_suspicious() {
        let fd = FailureDetector::new(NodeId::new("a"), Duration::from_secs(1), 5.0, 8.0, 100);
        assert_eq!(fd.calculate_phi(&NodeId::new("ghost")), f64::INFINITY);
    }

    #[test]
    fn fresh_heartbeat_reports_alive() {
        let fd = FailureDetector::new(NodeId::new("a"), Duration::from_millis(50), 5.0, 8.0, 100);
        let peer = NodeId::new("b");
        fd.receive_heartbeat(&peer);
        assert!(fd.calculate_phi(&peer) < 1.0);
    }

    #[test]
    fn recovering_a_failed_peer_is_reported() {
        let fd = FailureDetector::new(NodeId::new("a"), Duration::from_millis(10), 0.05, 8.0, 100);
        let peer = NodeId::new("b");
        fd.register_node(peer.clone());
        {
            let mut peers = fd.inner.peers.write().unwrap();
            let p = peers.get_mut(&peer).unwrap();
            p.state = NodeState::Failed;
            p.last_heartbeat = Instant::now() - Duration::from_secs(1);
        }
        let was_failed = fd.receive_heartbeat(&peer);
        assert!(was_failed);
        assert!(fd.is_node_alive(&peer));
    }

    #[test]
    fn erf_matches_known_values() {
        assert!((erf(0.0)).abs() < 1e-9);
        assert!((erf(1.0) - 0.8427007).abs() < 1e-6);
    }

    #[test]
    fn two_sample_fallback_uses_elapsed_over_timeout() {
        let history = VecDeque::new();
        assert_eq!(phi_from_history(2.5, &history, 5.0), 0.5);
    }
}

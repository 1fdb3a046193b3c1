//! Configuration surface.
//!
//! Values are layered, lowest precedence first: compiled-in defaults,
//! an optional TOML file, environment variables prefixed `CORONET_`,
//! then CLI flags parsed by the binary in `main.rs`. This mirrors the
//! layering a sibling crate might build on top of the `config`
//! crate for their own Raft tuning knobs.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::NodeId;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node_id: String,
    pub listen_host: String,
    pub listen_port: u16,
    /// `host:port` pairs for every other node in the cluster.
    pub peers: Vec<String>,

    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub liveness_heartbeat_interval_ms: u64,

    pub cache_capacity: usize,
    pub queue_capacity: usize,

    pub lock_timeout_secs: u64,
    pub deadlock_sweep_interval_secs: u64,
    pub lock_reaper_interval_secs: u64,

    pub queue_retry_sweep_interval_secs: u64,
    pub queue_in_flight_timeout_secs: u64,
    pub queue_max_retries: u32,
    pub queue_persistence_enabled: bool,
    pub queue_data_dir: String,

    pub phi_threshold: f64,
    pub failure_detector_window: usize,
    pub failure_detector_timeout_threshold_secs: f64,

    pub connection_retry_attempts: u32,
    pub connection_retry_delay_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: "node1".to_string(),
            listen_host: "0.0.0.0".to_string(),
            listen_port: 5000,
            peers: Vec::new(),

            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            liveness_heartbeat_interval_ms: 1000,

            cache_capacity: 1000,
            queue_capacity: 10_000,

            lock_timeout_secs: 30,
            deadlock_sweep_interval_secs: 5,
            lock_reaper_interval_secs: 5,

            queue_retry_sweep_interval_secs: 10,
            queue_in_flight_timeout_secs: 30,
            queue_max_retries: 3,
            queue_persistence_enabled: true,
            queue_data_dir: "data".to_string(),

            phi_threshold: 8.0,
            failure_detector_window: 100,
            failure_detector_timeout_threshold_secs: 5.0,

            connection_retry_attempts: 5,
            connection_retry_delay_ms: 1000,
            request_timeout_ms: 2000,
        }
    }
}

impl Config {
    /// Loads configuration from (in increasing precedence) built-in
    /// defaults, an optional TOML file at `path`, and environment
    /// variables prefixed `CORONET_` (e.g. `CORONET_LISTEN_PORT`).
    pub fn load(path: Option<&str>) -> Result<Self, ::config::ConfigError> {
        let mut builder = ::config::Config::new();
        let defaults = Config::default();
        builder.merge(::config::Config::try_from(&defaults)?)?;

        if let Some(path) = path {
            builder.merge(::config::File::with_name(path).required(false))?;
        }
        builder.merge(::config::Environment::with_prefix("CORONET").separator("_"))?;

        builder.try_into()
    }

    pub fn id(&self) -> NodeId {
        NodeId::new(self.node_id.clone())
    }

    pub fn listen_addr(&self) -> std::io::Result<SocketAddr> {
        format!("{}:{}", self.listen_host, self.listen_port)
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
    }

    /// Parses `peers` into `(NodeId, "host:port")` pairs. An entry may
    /// be either a bare `host:port` (the id is derived from the
    /// hostname component, e.g. `node2:5000` -> id `node2`) or an
    /// explicit `id@host:port` (used when several peers share a host,
    /// e.g. in a single-machine test cluster addressed by IP, where
    /// the hostname component alone can't tell peers apart).
    pub fn peer_addrs(&self) -> Vec<(NodeId, String)> {
        self.peers
            .iter()
            .filter_map(|entry| {
                let entry = entry.trim();
                if entry.is_empty() {
                    return None;
                }
                let (id, addr) = match entry.split_once('@') {
                    Some((id, addr)) => (id.to_string(), addr.to_string()),
                    None => {
                        let host = entry.rsplit_once(':').map(|(h, _)| h).unwrap_or(entry);
                        let id = host.split('.').next().unwrap_or(host).to_string();
                        (id, entry.to_string())
                    }
                };
                if id == self.node_id {
                    return None;
                }
                Some((NodeId::new(id), addr))
            })
            .collect()
    }

    pub fn election_timeout_range(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.election_timeout_min_ms),
            Duration::from_millis(self.election_timeout_max_ms),
        )
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let c = Config::default();
        assert_eq!(c.election_timeout_min_ms, 150);
        assert_eq!(c.election_timeout_max_ms, 300);
        assert_eq!(c.heartbeat_interval_ms, 50);
        assert_eq!(c.cache_capacity, 1000);
        assert_eq!(c.queue_capacity, 10_000);
        assert_eq!(c.lock_timeout_secs, 30);
        assert_eq!(c.deadlock_sweep_interval_secs, 5);
        assert_eq!(c.phi_threshold, 8.0);
    }

    #[test]
    fn peer_addrs_strips_self_and_derives_ids() {
        let mut c = Config::default();
        c.node_id = "node1".to_string();
        c.peers = vec![
            "node1:5000".to_string(),
            "node2:5000".to_string(),
            "node3:5000".to_string(),
        ];
        let peers = c.peer_addrs();
        assert_eq!(peers.len(), 2);
        assert!(peers.iter().any(|(id, _)| id.as_str() == "node2"));
        assert!(peers.iter().any(|(id, _)| id.as_str() == "node3"));
    }

    #[test]
    fn peer_addrs_honors_explicit_id_for_shared_hosts() {
        let mut c = Config::default();
        c.node_id = "a".to_string();
        c.peers = vec!["b@127.0.0.1:5001".to_string(), "c@127.0.0.1:5002".to_string()];
        let peers = c.peer_addrs();
        assert_eq!(peers.len(), 2);
        assert!(peers.contains(&(NodeId::new("b"), "127.0.0.1:5001".to_string())));
        assert!(peers.contains(&(NodeId::new("c"), "127.0.0.1:5002".to_string())));
    }
}

//! # PeerScorer (§4.3)
//!
//! A scalar score per peer from a weighted sum of per-topic and per-peer
//! signals. Gates mesh membership and gossip participation.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::identity::NodeId;

/// Per-term decay factors and weights for one topic's score contribution.
/// Not part of `RouterConfig` proper (score-term weighting is usually
/// tuned per deployment); exposed here so callers can override it.
#[derive(Debug, Clone)]
pub struct TopicScoreParams {
    pub time_in_mesh_weight: f64,
    pub time_in_mesh_cap: f64,
    pub time_in_mesh_quantum: Duration,
    pub first_message_deliveries_weight: f64,
    pub first_message_deliveries_decay: f64,
    pub first_message_deliveries_cap: f64,
    pub mesh_message_deliveries_weight: f64,
    pub mesh_message_deliveries_decay: f64,
    pub mesh_message_deliveries_threshold: f64,
    pub mesh_message_deliveries_activation: Duration,
    pub mesh_failure_penalty_weight: f64,
    pub mesh_failure_penalty_decay: f64,
    pub invalid_message_deliveries_weight: f64,
    pub invalid_message_deliveries_decay: f64,
}

impl Default for TopicScoreParams {
    fn default() -> Self {
        Self {
            time_in_mesh_weight: 0.0027,
            time_in_mesh_cap: 3600.0,
            time_in_mesh_quantum: Duration::from_secs(1),
            first_message_deliveries_weight: 0.5,
            first_message_deliveries_decay: 0.9,
            first_message_deliveries_cap: 100.0,
            mesh_message_deliveries_weight: -1.0,
            mesh_message_deliveries_decay: 0.9,
            mesh_message_deliveries_threshold: 10.0,
            mesh_message_deliveries_activation: Duration::from_secs(5),
            mesh_failure_penalty_weight: -1.0,
            mesh_failure_penalty_decay: 0.9,
            invalid_message_deliveries_weight: -10.0,
            invalid_message_deliveries_decay: 0.3,
        }
    }
}

#[derive(Debug, Clone)]
struct TopicCounters {
    in_mesh: bool,
    graft_time: Option<Instant>,
    mesh_message_deliveries_active: bool,
    first_message_deliveries: f64,
    mesh_message_deliveries: f64,
    mesh_failure_penalty: f64,
    invalid_message_deliveries: f64,
}

impl Default for TopicCounters {
    fn default() -> Self {
        Self {
            in_mesh: false,
            graft_time: None,
            mesh_message_deliveries_active: false,
            first_message_deliveries: 0.0,
            mesh_message_deliveries: 0.0,
            mesh_failure_penalty: 0.0,
            invalid_message_deliveries: 0.0,
        }
    }
}

struct PeerRecord {
    connected: bool,
    disconnected_at: Option<Instant>,
    ip: Option<IpAddr>,
    topics: HashMap<String, TopicCounters>,
    behavior_penalty: f64,
    app_specific: f64,
}

impl PeerRecord {
    fn new(ip: Option<IpAddr>) -> Self {
        Self {
            connected: true,
            disconnected_at: None,
            ip,
            topics: HashMap::new(),
            behavior_penalty: 0.0,
            app_specific: 0.0,
        }
    }
}

/// Internal state shared by every `PeerScorer` clone; guarded by one
/// reader-writer lock, matching the concurrency model in §5.
struct ScorerState {
    peers: HashMap<NodeId, PeerRecord>,
    ip_colocation: HashMap<IpAddr, usize>,
    last_decay: Instant,
}

pub struct PeerScorer {
    state: RwLock<ScorerState>,
    topic_weight: f64,
    topic_params: TopicScoreParams,
    ip_colocation_threshold: usize,
    ip_colocation_weight: f64,
    ip_whitelist: Vec<IpAddr>,
    retain_score: Duration,
    decay_interval: Duration,
    decay_to_zero: f64,
    gossip_threshold: f64,
    publish_threshold: f64,
    graylist_threshold: f64,
    accept_px_threshold: f64,
}

impl PeerScorer {
    pub fn new(
        gossip_threshold: f64,
        publish_threshold: f64,
        graylist_threshold: f64,
        accept_px_threshold: f64,
        retain_score: Duration,
        decay_interval: Duration,
        decay_to_zero: f64,
    ) -> Self {
        Self {
            state: RwLock::new(ScorerState {
                peers: HashMap::new(),
                ip_colocation: HashMap::new(),
                last_decay: Instant::now(),
            }),
            topic_weight: 1.0,
            topic_params: TopicScoreParams::default(),
            ip_colocation_threshold: 3,
            ip_colocation_weight: -1.0,
            ip_whitelist: Vec::new(),
            retain_score,
            decay_interval,
            decay_to_zero,
            gossip_threshold,
            publish_threshold,
            graylist_threshold,
            accept_px_threshold,
        }
    }

    pub fn add_peer(&self, peer: NodeId, ip: Option<IpAddr>) {
        let mut state = self.state.write();
        if let Some(ip) = ip {
            *state.ip_colocation.entry(ip).or_insert(0) += 1;
        }
        state.peers.entry(peer).or_insert_with(|| PeerRecord::new(ip));
    }

    pub fn remove_peer(&self, peer: &NodeId) {
        let mut state = self.state.write();
        if let Some(record) = state.peers.get_mut(peer) {
            record.connected = false;
            record.disconnected_at = Some(Instant::now());
        }
    }

    pub fn graft(&self, peer: &NodeId, topic: &str) {
        let mut state = self.state.write();
        if let Some(record) = state.peers.get_mut(peer) {
            let counters = record.topics.entry(topic.to_string()).or_default();
            counters.in_mesh = true;
            counters.graft_time = Some(Instant::now());
            counters.mesh_message_deliveries_active = false;
        }
    }

    pub fn prune(&self, peer: &NodeId, topic: &str) {
        let params = self.topic_params.clone();
        let mut state = self.state.write();
        if let Some(record) = state.peers.get_mut(peer) {
            if let Some(counters) = record.topics.get_mut(topic) {
                if counters.in_mesh && counters.mesh_message_deliveries_active {
                    let deficit =
                        (params.mesh_message_deliveries_threshold - counters.mesh_message_deliveries)
                            .max(0.0);
                    counters.mesh_failure_penalty += deficit * deficit;
                }
                counters.in_mesh = false;
                counters.graft_time = None;
            }
        }
    }

    pub fn validate_message(&self, peer: &NodeId, topic: &str, is_first: bool, is_valid: bool) {
        let mut state = self.state.write();
        if let Some(record) = state.peers.get_mut(peer) {
            let counters = record.topics.entry(topic.to_string()).or_default();
            if is_valid {
                if is_first {
                    counters.first_message_deliveries += 1.0;
                    if counters.in_mesh {
                        counters.mesh_message_deliveries += 1.0;
                    }
                }
            } else {
                counters.invalid_message_deliveries += 1.0;
            }
        }
    }

    /// If the peer is in-mesh and was the original first-deliverer, still
    /// credits mesh_message_deliveries (§9 open question: preserved as the
    /// literal observed behavior).
    pub fn duplicate_message(&self, peer: &NodeId, topic: &str, was_first_deliverer: bool) {
        if !was_first_deliverer {
            return;
        }
        let mut state = self.state.write();
        if let Some(record) = state.peers.get_mut(peer) {
            if let Some(counters) = record.topics.get_mut(topic) {
                if counters.in_mesh {
                    counters.mesh_message_deliveries += 1.0;
                }
            }
        }
    }

    pub fn broken_promise(&self, peer: &NodeId) {
        let mut state = self.state.write();
        if let Some(record) = state.peers.get_mut(peer) {
            record.behavior_penalty += 1.0;
        }
    }

    pub fn set_app_specific(&self, peer: &NodeId, score: f64) {
        let mut state = self.state.write();
        if let Some(record) = state.peers.get_mut(peer) {
            record.app_specific = score;
        }
    }

    /// `score(peer) = Σ_topic topic_weight · TopicScore(peer, t) + P5 + P6 + P7`.
    pub fn score(&self, peer: &NodeId) -> f64 {
        let state = self.state.read();
        let Some(record) = state.peers.get(peer) else {
            return 0.0;
        };
        let colocated = record
            .ip
            .map(|ip| state.ip_colocation.get(&ip).copied().unwrap_or(0))
            .unwrap_or(0);
        self.score_locked(record, colocated)
    }

    fn score_locked(&self, record: &PeerRecord, colocated_peers_at_ip: usize) -> f64 {
        let params = &self.topic_params;
        let mut total = 0.0;
        for counters in record.topics.values() {
            let time_in_mesh = counters
                .graft_time
                .map(|t| t.elapsed().as_secs_f64() / params.time_in_mesh_quantum.as_secs_f64())
                .unwrap_or(0.0)
                .min(params.time_in_mesh_cap);
            let p1 = time_in_mesh * params.time_in_mesh_weight;
            let p2 = counters.first_message_deliveries.min(params.first_message_deliveries_cap)
                * params.first_message_deliveries_weight;
            let deficit =
                (params.mesh_message_deliveries_threshold - counters.mesh_message_deliveries)
                    .max(0.0);
            let p3 = if counters.mesh_message_deliveries_active {
                deficit * deficit * params.mesh_message_deliveries_weight
            } else {
                0.0
            };
            let p3b = counters.mesh_failure_penalty * params.mesh_failure_penalty_weight;
            let p4 = counters.invalid_message_deliveries * counters.invalid_message_deliveries
                * params.invalid_message_deliveries_weight;
            total += self.topic_weight * (p1 + p2 + p3 + p3b + p4);
        }

        // P6: quadratic in the number of peers sharing this peer's IP above
        // the colocation threshold, unless the IP is whitelisted.
        let p6 = if record.ip.map(|ip| self.ip_whitelist.contains(&ip)).unwrap_or(true) {
            0.0
        } else {
            let over = (colocated_peers_at_ip as f64 - self.ip_colocation_threshold as f64).max(0.0);
            over * over * self.ip_colocation_weight
        };

        // P5 (app_specific) and P7 (behavior_penalty) are peer-global, added
        // once rather than per-topic; behavior_penalty is a raw incremented
        // count so its contribution is already negative by construction of
        // `broken_promise`'s weight below.
        let p7 = record.behavior_penalty * -1.0;

        total + record.app_specific + p6 + p7
    }

    pub fn is_below_gossip_threshold(&self, peer: &NodeId) -> bool {
        self.score(peer) < self.gossip_threshold
    }

    pub fn is_below_publish_threshold(&self, peer: &NodeId) -> bool {
        self.score(peer) < self.publish_threshold
    }

    pub fn is_below_graylist_threshold(&self, peer: &NodeId) -> bool {
        self.score(peer) < self.graylist_threshold
    }

    pub fn is_above_px_threshold(&self, peer: &NodeId) -> bool {
        self.score(peer) > self.accept_px_threshold
    }

    /// Idempotent if less than `decay_interval` has elapsed since the last
    /// call. Multiplies each counter by its decay factor raised to the
    /// number of elapsed intervals, clamping sub-`decay_to_zero` counters.
    pub fn decay(&self) {
        let mut state = self.state.write();
        let elapsed = state.last_decay.elapsed();
        if elapsed < self.decay_interval {
            return;
        }
        let intervals = (elapsed.as_secs_f64() / self.decay_interval.as_secs_f64()).floor().max(1.0);
        state.last_decay = Instant::now();

        let retain_score = self.retain_score;
        let decay_to_zero = self.decay_to_zero;
        let params = self.topic_params.clone();

        let mut to_remove = Vec::new();
        for (peer, record) in state.peers.iter_mut() {
            if !record.connected {
                if let Some(at) = record.disconnected_at {
                    if at.elapsed() >= retain_score {
                        to_remove.push(*peer);
                        continue;
                    }
                }
            }
            for counters in record.topics.values_mut() {
                counters.first_message_deliveries *=
                    params.first_message_deliveries_decay.powf(intervals);
                counters.mesh_message_deliveries *=
                    params.mesh_message_deliveries_decay.powf(intervals);
                counters.mesh_failure_penalty *= params.mesh_failure_penalty_decay.powf(intervals);
                counters.invalid_message_deliveries *=
                    params.invalid_message_deliveries_decay.powf(intervals);

                if counters.first_message_deliveries.abs() < decay_to_zero {
                    counters.first_message_deliveries = 0.0;
                }
                if counters.mesh_message_deliveries.abs() < decay_to_zero {
                    counters.mesh_message_deliveries = 0.0;
                }
                if counters.mesh_failure_penalty.abs() < decay_to_zero {
                    counters.mesh_failure_penalty = 0.0;
                }
                if counters.invalid_message_deliveries.abs() < decay_to_zero {
                    counters.invalid_message_deliveries = 0.0;
                }

                if let Some(graft_time) = counters.graft_time {
                    if !counters.mesh_message_deliveries_active
                        && graft_time.elapsed() >= params.mesh_message_deliveries_activation
                    {
                        counters.mesh_message_deliveries_active = true;
                    }
                }
            }
        }
        for peer in to_remove {
            if let Some(record) = state.peers.remove(&peer) {
                if let Some(ip) = record.ip {
                    if let Some(count) = state.ip_colocation.get_mut(&ip) {
                        *count = count.saturating_sub(1);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scorer() -> PeerScorer {
        PeerScorer::new(-500.0, -1000.0, -2500.0, 10.0, Duration::from_secs(600), Duration::from_millis(1), 0.01)
    }

    fn node_id(n: u8) -> NodeId {
        let mut bytes = [0u8; 32];
        bytes[0] = n;
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn unknown_peer_scores_zero() {
        let s = scorer();
        assert_eq!(s.score(&node_id(1)), 0.0);
    }

    #[test]
    fn invalid_messages_drive_score_negative() {
        let s = scorer();
        let p = node_id(1);
        s.add_peer(p, None);
        s.validate_message(&p, "t", false, false);
        s.validate_message(&p, "t", false, false);
        assert!(s.score(&p) < 0.0);
    }

    #[test]
    fn broken_promise_decreases_score() {
        let s = scorer();
        let p = node_id(1);
        s.add_peer(p, None);
        let before = s.score(&p);
        s.broken_promise(&p);
        assert!(s.score(&p) < before);
    }

    #[test]
    fn thresholds_respect_defaults() {
        let s = scorer();
        let p = node_id(1);
        s.add_peer(p, None);
        assert!(!s.is_below_gossip_threshold(&p));
        assert!(!s.is_below_publish_threshold(&p));
        assert!(!s.is_below_graylist_threshold(&p));
        assert!(!s.is_above_px_threshold(&p));
    }

    #[test]
    fn decay_is_idempotent_within_interval() {
        let s = PeerScorer::new(-500.0, -1000.0, -2500.0, 10.0, Duration::from_secs(600), Duration::from_secs(3600), 0.01);
        let p = node_id(1);
        s.add_peer(p, None);
        s.validate_message(&p, "t", false, false);
        let before = s.score(&p);
        s.decay();
        assert_eq!(s.score(&p), before);
    }

    #[test]
    fn decay_reduces_invalid_message_penalty_over_time() {
        let s = scorer();
        let p = node_id(1);
        s.add_peer(p, None);
        s.validate_message(&p, "t", false, false);
        let before = s.score(&p);
        std::thread::sleep(Duration::from_millis(5));
        s.decay();
        assert!(s.score(&p) > before);
    }

    #[test]
    fn remove_peer_retains_score_until_decay_after_retain_window() {
        let s = PeerScorer::new(-500.0, -1000.0, -2500.0, 10.0, Duration::from_millis(1), Duration::from_millis(1), 0.01);
        let p = node_id(1);
        s.add_peer(p, None);
        s.broken_promise(&p);
        s.remove_peer(&p);
        std::thread::sleep(Duration::from_millis(5));
        s.decay();
        assert_eq!(s.score(&p), 0.0, "reaped peer should score as unknown");
    }
}

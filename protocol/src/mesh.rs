//! # MeshManager (§4.1)

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use rand::rngs::OsRng;

use crate::error::MeshError;
use crate::identity::NodeId;
use crate::message::{PeerState, TopicState};
use crate::score::PeerScorer;

/// `(peer, topic) → expiry_time`, set on PRUNE with a nonzero backoff.
#[derive(Default)]
struct BackoffTable {
    entries: HashMap<(NodeId, String), Instant>,
}

impl BackoffTable {
    fn set(&mut self, peer: NodeId, topic: &str, backoff: Duration) {
        if backoff.is_zero() {
            return;
        }
        self.entries.insert((peer, topic.to_string()), Instant::now() + backoff);
    }

    fn is_active(&self, peer: &NodeId, topic: &str) -> bool {
        self.entries
            .get(&(*peer, topic.to_string()))
            .map(|expiry| Instant::now() < *expiry)
            .unwrap_or(false)
    }
}

pub struct MeshParams {
    pub d: usize,
    pub d_lo: usize,
    pub d_hi: usize,
    pub d_lazy: usize,
    pub d_out: usize,
    pub d_score: usize,
    pub fanout_ttl: Duration,
    pub prune_backoff: Duration,
}

struct MeshState {
    topics: HashMap<String, TopicState>,
    peers: HashMap<NodeId, PeerState>,
    backoff: BackoffTable,
    direct_peers: HashSet<NodeId>,
}

/// Owns per-topic mesh/fanout sets and the peer registry. One reader-writer
/// lock guards all of it (§5): readers proceed concurrently, one writer
/// excludes the rest.
pub struct MeshManager {
    state: RwLock<MeshState>,
    params: MeshParams,
}

impl MeshManager {
    pub fn new(params: MeshParams, direct_peers: HashSet<NodeId>) -> Self {
        Self {
            state: RwLock::new(MeshState {
                topics: HashMap::new(),
                peers: HashMap::new(),
                backoff: BackoffTable::default(),
                direct_peers,
            }),
            params,
        }
    }

    pub fn add_peer(&self, id: NodeId, outbound: bool) {
        let mut state = self.state.write();
        state.peers.entry(id).or_insert_with(|| PeerState::new(id, outbound));
    }

    pub fn remove_peer(&self, id: &NodeId) {
        let mut state = self.state.write();
        state.peers.remove(id);
        for topic in state.topics.values_mut() {
            topic.mesh.remove(id);
            topic.fanout.remove(id);
            topic.peers.remove(id);
        }
    }

    pub fn peer_connected(&self, id: &NodeId) -> bool {
        self.state.read().peers.get(id).map(|p| p.connected).unwrap_or(false)
    }

    pub fn note_peer_topic(&self, peer: &NodeId, topic: &str, subscribed: bool) {
        let mut state = self.state.write();
        if let Some(p) = state.peers.get_mut(peer) {
            if subscribed {
                p.topics.insert(topic.to_string());
            } else {
                p.topics.remove(topic);
            }
        }
        let topic_state = state.topics.entry(topic.to_string()).or_default();
        if subscribed {
            topic_state.peers.insert(*peer);
        } else {
            topic_state.peers.remove(peer);
            topic_state.mesh.remove(peer);
            topic_state.fanout.remove(peer);
        }
    }

    /// Sets the peer's initial-snapshot-sent flag if not already set.
    /// Returns `true` if this call set it (the caller should send the
    /// snapshot), `false` if it was already sent or the peer is unknown.
    pub fn mark_snapshot_sent(&self, peer: &NodeId) -> bool {
        let mut state = self.state.write();
        match state.peers.get_mut(peer) {
            Some(p) if !p.initial_snapshot_sent => {
                p.initial_snapshot_sent = true;
                true
            }
            _ => false,
        }
    }

    /// Current mesh membership for `topic` (empty if not subscribed).
    pub fn mesh_peers(&self, topic: &str) -> Vec<NodeId> {
        self.state
            .read()
            .topics
            .get(topic)
            .map(|t| t.mesh.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether `topic` is currently subscribed.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.state.read().topics.get(topic).map(|t| t.subscribed).unwrap_or(false)
    }

    /// Idempotent. Drains matching fanout into mesh, then tops up to `D`.
    /// Returns peers newly added to the mesh.
    pub fn join(&self, topic: &str, scorer: Option<&PeerScorer>) -> Vec<NodeId> {
        let mut state = self.state.write();
        state.topics.entry(topic.to_string()).or_default().subscribed = true;

        let fanout: Vec<NodeId> = state
            .topics
            .get(topic)
            .map(|t| t.fanout.iter().copied().collect())
            .unwrap_or_default();

        let mut added = Vec::new();
        for peer in &fanout {
            let topic_state = state.topics.get_mut(topic).unwrap();
            if topic_state.mesh.insert(*peer) {
                topic_state.fanout.remove(peer);
                added.push(*peer);
            }
        }

        let need = self.params.d.saturating_sub(state.topics.get(topic).unwrap().mesh.len());
        if need > 0 {
            let exclude: HashSet<NodeId> = state.topics.get(topic).unwrap().mesh.clone();
            let candidates = self.eligible_candidates(&state, topic, &exclude);
            let chosen = self.select(&state, &candidates, need, scorer);
            for peer in chosen {
                if state.topics.get_mut(topic).unwrap().mesh.insert(peer) {
                    added.push(peer);
                }
            }
        }
        added
    }

    fn eligible_candidates(&self, state: &MeshState, topic: &str, exclude: &HashSet<NodeId>) -> Vec<NodeId> {
        let Some(topic_state) = state.topics.get(topic) else {
            return Vec::new();
        };
        topic_state
            .peers
            .iter()
            .filter(|p| !exclude.contains(*p))
            .filter(|p| state.peers.get(p).map(|ps| ps.connected).unwrap_or(false))
            .filter(|p| !state.backoff.is_active(p, topic))
            .copied()
            .collect()
    }

    /// Random peer selection via Fisher-Yates, optionally narrowed to the
    /// top `min(d_score, N)` by score first when a scorer is present.
    fn select(&self, state: &MeshState, candidates: &[NodeId], count: usize, scorer: Option<&PeerScorer>) -> Vec<NodeId> {
        let mut pool: Vec<NodeId> = candidates.to_vec();
        if let Some(scorer) = scorer {
            pool.retain(|p| !scorer.is_below_graylist_threshold(p));
            if pool.len() > count {
                pool.sort_by(|a, b| scorer.score(b).partial_cmp(&scorer.score(a)).unwrap());
                let keep = self.params.d_score.max(count).min(pool.len());
                pool.truncate(keep);
            }
        }
        let _ = state;
        let mut rng = OsRng;
        pool.shuffle(&mut rng);
        pool.truncate(count);
        pool
    }

    /// Clears mesh; returns former mesh members (to which PRUNE must be sent).
    pub fn leave(&self, topic: &str) -> Vec<NodeId> {
        let mut state = self.state.write();
        let Some(topic_state) = state.topics.get_mut(topic) else {
            return Vec::new();
        };
        topic_state.subscribed = false;
        topic_state.mesh.drain().collect()
    }

    pub fn graft(&self, peer: &NodeId, topic: &str, scorer: Option<&PeerScorer>) -> Result<(), MeshError> {
        let mut state = self.state.write();
        let is_direct = state.direct_peers.contains(peer);
        {
            let topic_state = state
                .topics
                .get(topic)
                .ok_or_else(|| MeshError::NotSubscribed(topic.to_string()))?;
            if !topic_state.subscribed {
                return Err(MeshError::NotSubscribed(topic.to_string()));
            }
            if !topic_state.peers.contains(peer) {
                return Err(MeshError::PeerNotConnected(*peer));
            }
        }
        if !state.peers.get(peer).map(|p| p.connected).unwrap_or(false) {
            return Err(MeshError::PeerNotConnected(*peer));
        }
        if !is_direct && state.backoff.is_active(peer, topic) {
            return Err(MeshError::PeerBackedOff(*peer, topic.to_string()));
        }
        if let Some(scorer) = scorer {
            if !is_direct && scorer.is_below_graylist_threshold(peer) {
                return Err(MeshError::PeerGraylisted(*peer));
            }
        }
        state.topics.get_mut(topic).unwrap().mesh.insert(*peer);
        Ok(())
    }

    pub fn prune(&self, peer: &NodeId, topic: &str, backoff: Duration) {
        let mut state = self.state.write();
        if let Some(topic_state) = state.topics.get_mut(topic) {
            topic_state.mesh.remove(peer);
        }
        state.backoff.set(*peer, topic, backoff);
    }

    /// Returns or lazily materializes the fanout for `topic`; updates the
    /// last-published time.
    pub fn fanout_peers(&self, topic: &str) -> Vec<NodeId> {
        let mut state = self.state.write();
        let connected: Vec<NodeId> = state
            .peers
            .iter()
            .filter(|(_, p)| p.connected)
            .map(|(id, _)| *id)
            .collect();
        let topic_state = state.topics.entry(topic.to_string()).or_default();
        topic_state.last_published = Some(Instant::now());
        if topic_state.fanout.is_empty() {
            let candidates: Vec<NodeId> = topic_state
                .peers
                .iter()
                .filter(|p| connected.contains(p))
                .copied()
                .collect();
            for peer in candidates.into_iter().take(self.mesh_d_for_fanout()) {
                topic_state.fanout.insert(peer);
            }
        }
        topic_state.fanout.iter().filter(|p| connected.contains(p)).copied().collect()
    }

    fn mesh_d_for_fanout(&self) -> usize {
        self.params.d
    }

    /// Up to `Dlazy` topic peers not in mesh and not below gossip threshold.
    pub fn select_gossip_peers(&self, topic: &str, scorer: Option<&PeerScorer>) -> Vec<NodeId> {
        let state = self.state.read();
        let Some(topic_state) = state.topics.get(topic) else {
            return Vec::new();
        };
        let mut candidates: Vec<NodeId> = topic_state
            .peers
            .iter()
            .filter(|p| !topic_state.mesh.contains(*p))
            .filter(|p| scorer.map(|s| !s.is_below_gossip_threshold(p)).unwrap_or(true))
            .copied()
            .collect();
        let mut rng = OsRng;
        candidates.shuffle(&mut rng);
        candidates.truncate(self.params.d_lazy);
        candidates
    }

    /// Up to `count` topic peers above `accept_px_threshold`.
    pub fn get_px_peers(&self, topic: &str, exclude: &NodeId, count: usize, scorer: Option<&PeerScorer>) -> Vec<NodeId> {
        let state = self.state.read();
        let Some(topic_state) = state.topics.get(topic) else {
            return Vec::new();
        };
        let mut candidates: Vec<NodeId> = topic_state
            .peers
            .iter()
            .filter(|p| *p != exclude)
            .filter(|p| scorer.map(|s| s.is_above_px_threshold(p)).unwrap_or(true))
            .copied()
            .collect();
        let mut rng = OsRng;
        candidates.shuffle(&mut rng);
        candidates.truncate(count);
        candidates
    }

    /// If `from` is above `accept_px_threshold`, returns unknown peer ids.
    pub fn handle_px(&self, from: &NodeId, peers: &[NodeId], scorer: Option<&PeerScorer>) -> Vec<NodeId> {
        if let Some(scorer) = scorer {
            if !scorer.is_above_px_threshold(from) {
                return Vec::new();
            }
        }
        let state = self.state.read();
        peers.iter().filter(|p| !state.peers.contains_key(p)).copied().collect()
    }

    pub fn cleanup_fanout(&self) {
        let mut state = self.state.write();
        let ttl = self.params.fanout_ttl;
        for topic_state in state.topics.values_mut() {
            let stale = topic_state
                .last_published
                .map(|t| t.elapsed() >= ttl)
                .unwrap_or(false);
            if stale {
                topic_state.fanout.clear();
            }
        }
    }

    /// Returns `(grafts, prunes)`, each a list of `(topic, peer)`.
    pub fn heartbeat_maintenance(&self, scorer: Option<&PeerScorer>) -> (Vec<(String, NodeId)>, Vec<(String, NodeId)>) {
        let topics: Vec<String> = self.state.read().topics.iter().filter(|(_, t)| t.subscribed).map(|(k, _)| k.clone()).collect();
        let mut grafts = Vec::new();
        let mut prunes = Vec::new();

        for topic in &topics {
            let mut state = self.state.write();
            let mesh_len = state.topics.get(topic).map(|t| t.mesh.len()).unwrap_or(0);

            if mesh_len < self.params.d_lo {
                let need = self.params.d - mesh_len;
                let exclude: HashSet<NodeId> = state.topics.get(topic).unwrap().mesh.clone();
                let candidates = self.eligible_candidates(&state, topic, &exclude);
                let chosen = self.select(&state, &candidates, need, scorer);
                for peer in chosen {
                    if state.topics.get_mut(topic).unwrap().mesh.insert(peer) {
                        grafts.push((topic.clone(), peer));
                    }
                }
            } else if mesh_len > self.params.d_hi {
                let excess = mesh_len - self.params.d;
                let direct = state.direct_peers.clone();
                let mut members: Vec<NodeId> = state.topics.get(topic).unwrap().mesh.iter().copied().collect();
                members.retain(|p| !direct.contains(p));
                members.sort_by(|a, b| {
                    let a_outbound = state.peers.get(a).map(|p| p.outbound).unwrap_or(false);
                    let b_outbound = state.peers.get(b).map(|p| p.outbound).unwrap_or(false);
                    a_outbound.cmp(&b_outbound).then_with(|| {
                        let sa = scorer.map(|s| s.score(a)).unwrap_or(0.0);
                        let sb = scorer.map(|s| s.score(b)).unwrap_or(0.0);
                        sa.partial_cmp(&sb).unwrap()
                    })
                });
                for peer in members.into_iter().take(excess) {
                    state.topics.get_mut(topic).unwrap().mesh.remove(&peer);
                    state.backoff.set(peer, topic, self.params.prune_backoff);
                    prunes.push((topic.clone(), peer));
                }
            }

            let outbound_in_mesh = state
                .topics
                .get(topic)
                .unwrap()
                .mesh
                .iter()
                .filter(|p| state.peers.get(p).map(|ps| ps.outbound).unwrap_or(false))
                .count();
            if outbound_in_mesh < self.params.d_out {
                let need = self.params.d_out - outbound_in_mesh;
                let exclude: HashSet<NodeId> = state.topics.get(topic).unwrap().mesh.clone();
                let candidates: Vec<NodeId> = self
                    .eligible_candidates(&state, topic, &exclude)
                    .into_iter()
                    .filter(|p| state.peers.get(p).map(|ps| ps.outbound).unwrap_or(false))
                    .collect();
                let chosen = self.select(&state, &candidates, need, scorer);
                for peer in chosen {
                    if state.topics.get_mut(topic).unwrap().mesh.insert(peer) {
                        grafts.push((topic.clone(), peer));
                    }
                }
            }
        }

        self.cleanup_fanout();
        (grafts, prunes)
    }
}

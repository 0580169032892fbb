//! # Heartbeat (§4.4)
//!
//! The periodic driver that keeps mesh membership healthy, emits gossip, and
//! folds scoring decay and broken-promise accounting into the same tick. One
//! `tokio::sync::watch` channel gates shutdown the same way the rest of the
//! async surface in this crate does.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::{IWantTracker, MessageCache};
use crate::identity::NodeId;
use crate::mesh::MeshManager;
use crate::score::PeerScorer;

/// Emitted per tick so the router can turn grafts/prunes/gossip into wire
/// sends without the heartbeat needing to know about streams or codecs.
#[derive(Debug, Default)]
pub struct HeartbeatOutcome {
    pub grafts: Vec<(String, NodeId)>,
    pub prunes: Vec<(String, NodeId, Vec<NodeId>, Duration)>,
    pub ihave: Vec<(NodeId, String, Vec<crate::message::MessageId>)>,
}

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub initial_delay: Duration,
    pub max_ihave_length: usize,
    pub iwant_followup_time: Duration,
    pub prune_backoff: Duration,
    pub slow_heartbeat_warning: Duration,
    pub opportunistic_graft_ticks: u64,
    pub opportunistic_graft_peers: usize,
    pub opportunistic_graft_threshold: f64,
}

/// Ticks `MeshManager`, `PeerScorer`, `MessageCache`, and `IWantTracker` in
/// lockstep. Does not itself touch the network — callers receiving a
/// [`HeartbeatOutcome`] are responsible for turning it into GRAFT/PRUNE/IHAVE
/// wire sends (that's the router's job, not this module's).
pub struct Heartbeat {
    mesh: Arc<MeshManager>,
    scorer: Arc<PeerScorer>,
    cache: Arc<parking_lot::RwLock<MessageCache>>,
    iwant: Arc<parking_lot::RwLock<IWantTracker>>,
    config: HeartbeatConfig,
    tick_count: AtomicU64,
}

impl Heartbeat {
    pub fn new(
        mesh: Arc<MeshManager>,
        scorer: Arc<PeerScorer>,
        cache: Arc<parking_lot::RwLock<MessageCache>>,
        iwant: Arc<parking_lot::RwLock<IWantTracker>>,
        config: HeartbeatConfig,
    ) -> Self {
        Self {
            mesh,
            scorer,
            cache,
            iwant,
            config,
            tick_count: AtomicU64::new(0),
        }
    }

    /// Executes one tick's nine steps and returns the outcome the router
    /// should translate into wire sends. `topics` lists every currently
    /// subscribed topic (the router owns that set; the heartbeat only
    /// drives maintenance over whatever it's told about).
    pub fn tick(&self, topics: &[String]) -> HeartbeatOutcome {
        // 1. Decay.
        self.scorer.decay();

        // 2-4. Mesh maintenance, then translate prunes into PRUNE{peers=PX}.
        let (grafts, prunes_raw) = self.mesh.heartbeat_maintenance(Some(&self.scorer));
        let mut prunes = Vec::with_capacity(prunes_raw.len());
        for (topic, peer) in prunes_raw {
            let px = self.mesh.get_px_peers(&topic, &peer, 10, Some(&self.scorer));
            prunes.push((topic, peer, px, self.config.prune_backoff));
        }

        // 5. Fanout cleanup (also run inside `heartbeat_maintenance`, but the
        // spec lists it as its own step — a second call is a no-op).
        self.mesh.cleanup_fanout();

        // 6. Advance the cache window.
        self.cache.write().shift();

        // 7. Gossip emission.
        let mut ihave = Vec::new();
        for topic in topics {
            let ids = {
                let cache = self.cache.read();
                let mut ids = cache.gossip_ids(topic);
                ids.truncate(self.config.max_ihave_length);
                ids
            };
            if ids.is_empty() {
                continue;
            }
            for peer in self.mesh.select_gossip_peers(topic, Some(&self.scorer)) {
                ihave.push((peer, topic.clone(), ids.clone()));
            }
        }

        // 8. Broken promises.
        let broken = self.iwant.write().broken_promises(self.config.iwant_followup_time);
        for (peer, count) in broken {
            for _ in 0..count {
                self.scorer.broken_promise(&peer);
            }
        }

        // 9. Opportunistic graft (every `opportunistic_graft_ticks` ticks).
        let tick = self.tick_count.fetch_add(1, Ordering::Relaxed) + 1;
        let mut opportunistic_grafts = Vec::new();
        if tick % self.config.opportunistic_graft_ticks == 0 {
            for topic in topics {
                opportunistic_grafts.extend(self.opportunistic_graft_for_topic(topic));
            }
        }

        let mut grafts: Vec<(String, NodeId)> = grafts;
        grafts.extend(opportunistic_grafts);

        HeartbeatOutcome { grafts, prunes, ihave }
    }

    fn opportunistic_graft_for_topic(&self, topic: &str) -> Vec<(String, NodeId)> {
        let candidates = self.mesh.select_gossip_peers(topic, Some(&self.scorer));
        if candidates.is_empty() {
            return Vec::new();
        }
        let mut scores: Vec<f64> = candidates.iter().map(|p| self.scorer.score(p)).collect();
        scores.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let median = if scores.is_empty() {
            0.0
        } else {
            scores[scores.len() / 2]
        };
        if median >= self.config.opportunistic_graft_threshold {
            return Vec::new();
        }

        let mut above_median: Vec<NodeId> = candidates
            .into_iter()
            .filter(|p| self.scorer.score(p) > median)
            .collect();
        above_median.truncate(self.config.opportunistic_graft_peers);

        let mut grafted = Vec::new();
        for peer in above_median {
            if self.mesh.graft(&peer, topic, Some(&self.scorer)).is_ok() {
                grafted.push((topic.to_string(), peer));
            }
        }
        grafted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::MeshParams;
    use std::collections::HashSet;

    fn node_id(n: u8) -> NodeId {
        let mut bytes = [0u8; 32];
        bytes[0] = n;
        NodeId::from_bytes(bytes)
    }

    fn test_config() -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_millis(10),
            initial_delay: Duration::from_millis(1),
            max_ihave_length: 5000,
            iwant_followup_time: Duration::from_secs(3),
            prune_backoff: Duration::from_secs(60),
            slow_heartbeat_warning: Duration::from_millis(100),
            opportunistic_graft_ticks: 2,
            opportunistic_graft_peers: 2,
            opportunistic_graft_threshold: 0.0,
        }
    }

    fn harness(n: u8) -> (Heartbeat, Vec<NodeId>) {
        let params = MeshParams {
            d: 3,
            d_lo: 2,
            d_hi: 6,
            d_lazy: 3,
            d_out: 1,
            d_score: 2,
            fanout_ttl: Duration::from_secs(60),
            prune_backoff: Duration::from_secs(60),
        };
        let mesh = Arc::new(MeshManager::new(params, HashSet::new()));
        let scorer = Arc::new(PeerScorer::new(-500.0, -1000.0, -2500.0, 10.0, Duration::from_secs(600), Duration::from_secs(3600), 0.01));
        let cache = Arc::new(parking_lot::RwLock::new(MessageCache::new(5, 3)));
        let iwant = Arc::new(parking_lot::RwLock::new(IWantTracker::new()));

        let mut ids = Vec::new();
        for i in 1..=n {
            let id = node_id(i);
            mesh.add_peer(id, i % 2 == 0);
            scorer.add_peer(id, None);
            mesh.note_peer_topic(&id, "t", true);
            ids.push(id);
        }
        mesh.join("t", Some(&scorer));

        (Heartbeat::new(mesh, scorer, cache, iwant, test_config()), ids)
    }

    #[test]
    fn tick_shifts_cache_window() {
        let (hb, _ids) = harness(3);
        hb.tick(&["t".to_string()]);
    }

    #[test]
    fn tick_emits_ihave_for_cached_messages() {
        let (hb, ids) = harness(5);
        {
            let mut cache = hb.cache.write();
            cache.put(crate::message::CacheEntry {
                message: crate::message::Message::new("t", ids[0], 1, vec![1, 2, 3]),
                received_from: ids[0],
                received_at: Instant::now(),
                validated: true,
                valid: true,
            });
        }
        let outcome = hb.tick(&["t".to_string()]);
        assert!(!outcome.ihave.is_empty());
    }

    #[test]
    fn opportunistic_graft_only_fires_on_schedule() {
        let (hb, _ids) = harness(5);
        let first = hb.tick(&["t".to_string()]);
        assert!(first.grafts.is_empty() || hb.tick_count.load(Ordering::Relaxed) % 2 == 0);
        let _ = hb.tick(&["t".to_string()]);
    }

    #[test]
    fn broken_promises_feed_scorer_penalty() {
        let (hb, ids) = harness(2);
        let id = crate::message::MessageId::new(&ids[0], 1);
        hb.iwant.write().track(id, ids[1]);
        let before = hb.scorer.score(&ids[1]);
        std::thread::sleep(Duration::from_millis(5));
        let tiny_followup = HeartbeatConfig { iwant_followup_time: Duration::from_millis(1), ..test_config() };
        let hb2 = Heartbeat::new(
            Arc::clone(&hb.mesh),
            Arc::clone(&hb.scorer),
            Arc::clone(&hb.cache),
            Arc::clone(&hb.iwant),
            tiny_followup,
        );
        hb2.tick(&["t".to_string()]);
        assert!(hb.scorer.score(&ids[1]) < before);
    }
}

//! # MessageCache, SeenCache, IWantTracker (§4.2)

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::identity::NodeId;
use crate::message::{CacheEntry, Message, MessageId};

/// A ring of `history_length` per-heartbeat buckets plus a flat id→entry
/// index. `Shift()` is called once per heartbeat; after `history_length`
/// shifts, a message put at the first tick is no longer retrievable.
pub struct MessageCache {
    buckets: Vec<Vec<MessageId>>,
    current: usize,
    index: HashMap<MessageId, CacheEntry>,
    history_gossip: usize,
}

impl MessageCache {
    pub fn new(history_length: usize, history_gossip: usize) -> Self {
        assert!(history_length > 0, "history_length must be positive");
        Self {
            buckets: vec![Vec::new(); history_length],
            current: 0,
            index: HashMap::new(),
            history_gossip,
        }
    }

    /// No-op if the id is already indexed; otherwise inserts into the
    /// current bucket and the index.
    pub fn put(&mut self, entry: CacheEntry) {
        let id = entry.message.id();
        if self.index.contains_key(&id) {
            return;
        }
        self.buckets[self.current].push(id);
        self.index.insert(id, entry);
    }

    pub fn get(&self, id: &MessageId) -> Option<&CacheEntry> {
        self.index.get(id)
    }

    pub fn get_message(&self, id: &MessageId) -> Option<&Message> {
        self.index.get(id).map(|e| &e.message)
    }

    pub fn has(&self, id: &MessageId) -> bool {
        self.index.contains_key(id)
    }

    /// Concatenates ids from the most recent `history_gossip` buckets whose
    /// message topic equals `topic`, most recent first.
    pub fn gossip_ids(&self, topic: &str) -> Vec<MessageId> {
        let mut out = Vec::new();
        let len = self.buckets.len();
        for back in 0..self.history_gossip.min(len) {
            let bucket_idx = (self.current + len - back) % len;
            for id in &self.buckets[bucket_idx] {
                if let Some(entry) = self.index.get(id) {
                    if entry.message.topic == topic {
                        out.push(*id);
                    }
                }
            }
        }
        out
    }

    /// Advances the current bucket and evicts the bucket being overwritten
    /// from both the ring and the index.
    pub fn shift(&mut self) {
        let len = self.buckets.len();
        self.current = (self.current + 1) % len;
        for id in self.buckets[self.current].drain(..) {
            self.index.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

/// A bounded dedup set. `Add` returns whether the id was newly added; at
/// capacity, a TTL sweep runs first, then (if still full) the 10% oldest
/// entries by insertion time are force-evicted.
pub struct SeenCache {
    ttl: Duration,
    capacity: usize,
    entries: HashMap<MessageId, Instant>,
    order: VecDeque<MessageId>,
}

impl SeenCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn has(&self, id: &MessageId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn add(&mut self, id: MessageId) -> bool {
        if self.entries.contains_key(&id) {
            return false;
        }
        if self.entries.len() >= self.capacity {
            self.sweep_ttl();
            if self.entries.len() >= self.capacity {
                self.force_evict_oldest();
            }
        }
        let now = Instant::now();
        self.entries.insert(id, now);
        self.order.push_back(id);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn sweep_ttl(&mut self) {
        let now = Instant::now();
        let ttl = self.ttl;
        self.entries.retain(|_, t| now.duration_since(*t) < ttl);
        self.order.retain(|id| self.entries.contains_key(id));
    }

    fn force_evict_oldest(&mut self) {
        let to_evict = (self.capacity / 10).max(1);
        let mut evicted = 0;
        while evicted < to_evict {
            let Some(id) = self.order.pop_front() else { break };
            if self.entries.remove(&id).is_some() {
                evicted += 1;
            }
        }
    }
}

#[derive(Debug, Default)]
struct IWantRecord {
    requested_at: Instant,
    peers_asked: HashSet<NodeId>,
}

/// Tracks outstanding IWANT requests so unfulfilled promises can be charged
/// to the asking peer's score after `iwant_followup_time`.
#[derive(Default)]
pub struct IWantTracker {
    records: HashMap<MessageId, IWantRecord>,
}

impl IWantTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a request time and asking peer; if a record for `id` already
    /// exists, `peer` is added to it instead of resetting the request time.
    pub fn track(&mut self, id: MessageId, peer: NodeId) {
        let record = self.records.entry(id).or_insert_with(|| IWantRecord {
            requested_at: Instant::now(),
            peers_asked: HashSet::new(),
        });
        record.peers_asked.insert(peer);
    }

    pub fn fulfill(&mut self, id: &MessageId) {
        self.records.remove(id);
    }

    /// Atomically extracts and removes every record older than
    /// `iwant_followup_time`, returning each implicated peer's broken-promise
    /// count.
    pub fn broken_promises(&mut self, iwant_followup_time: Duration) -> HashMap<NodeId, u32> {
        let now = Instant::now();
        let mut counts: HashMap<NodeId, u32> = HashMap::new();
        self.records.retain(|_, record| {
            if now.duration_since(record.requested_at) >= iwant_followup_time {
                for peer in &record.peers_asked {
                    *counts.entry(*peer).or_insert(0) += 1;
                }
                false
            } else {
                true
            }
        });
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_id(n: u8) -> NodeId {
        let mut bytes = [0u8; 32];
        bytes[0] = n;
        NodeId::from_bytes(bytes)
    }

    fn entry(topic: &str, from: u8, seq: u64) -> CacheEntry {
        let from_id = node_id(from);
        CacheEntry {
            message: Message::new(topic, from_id, seq, vec![]),
            received_from: from_id,
            received_at: Instant::now(),
            validated: true,
            valid: true,
        }
    }

    #[test]
    fn put_is_idempotent() {
        let mut cache = MessageCache::new(5, 3);
        let e = entry("t", 1, 1);
        let id = e.message.id();
        cache.put(e.clone());
        cache.put(e);
        assert_eq!(cache.len(), 1);
        assert!(cache.has(&id));
    }

    #[test]
    fn shift_evicts_after_history_length() {
        let mut cache = MessageCache::new(3, 3);
        let e = entry("t", 1, 1);
        let id = e.message.id();
        cache.put(e);
        assert!(cache.has(&id));
        cache.shift();
        assert!(cache.has(&id));
        cache.shift();
        assert!(cache.has(&id));
        cache.shift();
        assert!(!cache.has(&id), "message must be evicted after history_length shifts");
    }

    #[test]
    fn gossip_ids_filters_by_topic_and_lookback() {
        let mut cache = MessageCache::new(5, 2);
        cache.put(entry("a", 1, 1));
        cache.shift();
        cache.put(entry("b", 1, 2));
        cache.shift();
        cache.put(entry("a", 1, 3));

        let ids = cache.gossip_ids("a");
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0].seq(), 3);
    }

    #[test]
    fn seen_cache_add_returns_false_on_duplicate() {
        let mut seen = SeenCache::new(Duration::from_secs(120), 100);
        let id = entry("t", 1, 1).message.id();
        assert!(seen.add(id));
        assert!(!seen.add(id));
        assert!(seen.has(&id));
    }

    #[test]
    fn seen_cache_force_evicts_at_capacity() {
        let mut seen = SeenCache::new(Duration::from_secs(120), 10);
        for i in 0..10u64 {
            seen.add(entry("t", 1, i).message.id());
        }
        assert_eq!(seen.len(), 10);
        seen.add(entry("t", 1, 999).message.id());
        assert!(seen.len() <= 10);
        assert!(seen.has(&entry("t", 1, 999).message.id()));
    }

    #[test]
    fn iwant_tracker_fulfill_removes_record() {
        let mut tracker = IWantTracker::new();
        let id = entry("t", 1, 1).message.id();
        tracker.track(id, node_id(2));
        tracker.fulfill(&id);
        let broken = tracker.broken_promises(Duration::from_secs(0));
        assert!(broken.is_empty());
    }

    #[test]
    fn iwant_tracker_broken_promises_counts_per_peer() {
        let mut tracker = IWantTracker::new();
        let id1 = entry("t", 1, 1).message.id();
        let id2 = entry("t", 1, 2).message.id();
        tracker.track(id1, node_id(9));
        tracker.track(id2, node_id(9));
        std::thread::sleep(Duration::from_millis(5));
        let broken = tracker.broken_promises(Duration::from_millis(1));
        assert_eq!(broken.get(&node_id(9)), Some(&2));
    }

    #[test]
    fn iwant_tracker_multiple_peers_same_id() {
        let mut tracker = IWantTracker::new();
        let id = entry("t", 1, 1).message.id();
        tracker.track(id, node_id(1));
        tracker.track(id, node_id(2));
        std::thread::sleep(Duration::from_millis(5));
        let broken = tracker.broken_promises(Duration::from_millis(1));
        assert_eq!(broken.get(&node_id(1)), Some(&1));
        assert_eq!(broken.get(&node_id(2)), Some(&1));
    }
}

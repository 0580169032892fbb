//! # Message & Related Data Model Types (§3)

use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::crypto::KeyType;
use crate::identity::NodeId;

/// The on-wire dedup key: `from ‖ seq_be64`, 40 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId([u8; 40]);

impl MessageId {
    pub fn new(from: &NodeId, seq: u64) -> Self {
        let mut bytes = [0u8; 40];
        bytes[..32].copy_from_slice(from.as_bytes());
        bytes[32..].copy_from_slice(&seq.to_be_bytes());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 40] {
        &self.0
    }

    pub fn from(&self) -> NodeId {
        NodeId::try_from_slice(&self.0[..32]).expect("first 32 bytes of a MessageId")
    }

    pub fn seq(&self) -> u64 {
        let mut arr = [0u8; 8];
        arr.copy_from_slice(&self.0[32..]);
        u64::from_be_bytes(arr)
    }
}

impl std::fmt::Debug for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageId({}/{})", self.from(), self.seq())
    }
}

/// The publishable unit. `id` and `timestamp` are never wire-serialized —
/// `id` is recomputed by the receiver, `timestamp` is re-stamped on local
/// receipt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    pub from: NodeId,
    pub data: Vec<u8>,
    pub seq: u64,
    pub signature: Option<Vec<u8>>,
    pub key: Option<Vec<u8>>,
    pub key_type: Option<KeyType>,
}

impl Message {
    pub fn new(topic: impl Into<String>, from: NodeId, seq: u64, data: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            from,
            data,
            seq,
            signature: None,
            key: None,
            key_type: None,
        }
    }

    pub fn id(&self) -> MessageId {
        MessageId::new(&self.from, self.seq)
    }

    /// Basic field validation, independent of signature checking: non-empty
    /// topic, `from` not the zero id, `data` within the size cap.
    pub fn validate_basic(&self, max_message_size: usize) -> Result<(), &'static str> {
        if self.topic.is_empty() {
            return Err("empty topic");
        }
        if self.from.is_zero() {
            return Err("from is zero");
        }
        if self.data.len() > max_message_size {
            return Err("data exceeds max_message_size");
        }
        Ok(())
    }
}

/// A local subscriber handle's view of the topic it subscribed to. The
/// actual delivery queue and cancellation token live in `router::Subscription`
/// (a `tokio::sync::mpsc` channel can't itself derive `Clone`/`Debug`
/// usefully, so this type only tracks the bookkeeping fields).
#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    pub topic: String,
    pub active: bool,
}

/// Global per-peer state, created on first connection callback and torn
/// down after `retain_score` once disconnected.
#[derive(Debug, Clone)]
pub struct PeerState {
    pub id: NodeId,
    pub connected: bool,
    pub outbound: bool,
    pub topics: std::collections::HashSet<String>,
    pub first_seen: Instant,
    pub last_seen: Instant,
    /// Set once the initial subscription snapshot has been sent to this
    /// peer; cleared only on `RemovePeer` (§9 open question: not re-cleared
    /// on PRUNE-then-reconnect, matching the literal source behavior).
    pub initial_snapshot_sent: bool,
}

impl PeerState {
    pub fn new(id: NodeId, outbound: bool) -> Self {
        let now = Instant::now();
        Self {
            id,
            connected: true,
            outbound,
            topics: std::collections::HashSet::new(),
            first_seen: now,
            last_seen: now,
            initial_snapshot_sent: false,
        }
    }
}

/// Per-subscribed-topic state. Invariants: `mesh ⊆ peers`, `fanout ⊆ peers`,
/// `mesh ∩ fanout = ∅` while subscribed.
#[derive(Debug, Clone, Default)]
pub struct TopicState {
    pub subscribed: bool,
    pub mesh: std::collections::HashSet<NodeId>,
    pub fanout: std::collections::HashSet<NodeId>,
    pub peers: std::collections::HashSet<NodeId>,
    /// Last time `FanoutPeers` delivered a publish for this topic; used by
    /// `CleanupFanout` to evict stale fanout sets after `fanout_ttl`.
    pub last_published: Option<Instant>,
}

/// A cached history entry. The first peer to deliver a given id is recorded
/// in `received_from` and never overwritten.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub message: Message,
    pub received_from: NodeId,
    pub received_at: Instant,
    pub validated: bool,
    pub valid: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_id(n: u8) -> NodeId {
        let mut bytes = [0u8; 32];
        bytes[0] = n;
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn message_id_encodes_from_and_seq() {
        let from = node_id(3);
        let id = MessageId::new(&from, 42);
        assert_eq!(id.from(), from);
        assert_eq!(id.seq(), 42);
        assert_eq!(id.as_bytes().len(), 40);
    }

    #[test]
    fn validate_basic_rejects_zero_from() {
        let msg = Message::new("t", NodeId::ZERO, 1, vec![]);
        assert_eq!(msg.validate_basic(1024).unwrap_err(), "from is zero");
    }

    #[test]
    fn validate_basic_rejects_oversize_data() {
        let msg = Message::new("t", node_id(1), 1, vec![0u8; 10]);
        assert_eq!(msg.validate_basic(5).unwrap_err(), "data exceeds max_message_size");
    }

    #[test]
    fn validate_basic_accepts_boundary_size() {
        let msg = Message::new("t", node_id(1), 1, vec![0u8; 10]);
        assert!(msg.validate_basic(10).is_ok());
    }

    #[test]
    fn topic_state_invariants_hold_on_default() {
        let state = TopicState::default();
        assert!(state.mesh.is_disjoint(&state.fanout));
        assert!(state.mesh.is_subset(&state.peers));
    }
}

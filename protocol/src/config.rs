//! # Router Configuration & Constants
//!
//! Every tunable in the mesh lives here. The defaults reproduce the
//! GossipSub v1.1 reference parameters so independent implementations
//! following the same table interoperate.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Protocol identifiers (§6) — opaque strings the endpoint keys handler
// registration on. Exact values are part of the wire contract; don't change
// them without a protocol version bump.
// ---------------------------------------------------------------------------

pub const PROTOCOL_ID_GOSSIPSUB: &str = "system/gossipsub/1.1";
pub const PROTOCOL_ID_REQ: &str = "app/msg/req/1.0";
pub const PROTOCOL_ID_NOTIFY: &str = "app/msg/notify/1.0";
pub const PROTOCOL_ID_PUBSUB_FALLBACK: &str = "app/msg/pubsub/1.0";
pub const PROTOCOL_ID_QUERY: &str = "app/msg/query/1.0";
pub const PROTOCOL_ID_QUERY_RESPONSE: &str = "app/msg/qresp/1.0";

/// Maximum frame length on any stream: `10 · 2^20` bytes.
pub const MAX_FRAME_LEN: u32 = 10 * 1024 * 1024;

/// Realm-scoped topics carry this prefix; the suffix up to the next `/` is
/// the realm id checked against the connection's `RealmContext`.
pub const REALM_TOPIC_PREFIX: &str = "realm/";

// ---------------------------------------------------------------------------
// RouterConfig
// ---------------------------------------------------------------------------

/// All tunables for a `Router` and the components it owns. Serializable so
/// the `node` binary can load an overlay from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Publish cutoff and receive cap.
    pub max_message_size: usize,
    /// Period of the heartbeat driver.
    pub heartbeat_interval: Duration,
    /// Delay before the first heartbeat tick after `Start`.
    pub heartbeat_initial_delay: Duration,
    /// `MessageCache` ring length.
    pub history_length: usize,
    /// IHAVE lookback, in buckets.
    pub history_gossip: usize,
    /// Fanout entry expiry.
    pub fanout_ttl: Duration,
    /// `SeenCache` entry TTL.
    pub seen_ttl: Duration,
    /// `SeenCache` capacity before forced eviction.
    pub seen_cache_capacity: usize,
    /// Backoff applied after an outgoing PRUNE.
    pub prune_backoff: Duration,
    /// Broken-promise cutoff for outstanding IWANTs.
    pub iwant_followup_time: Duration,
    /// Max ids per outgoing IHAVE.
    pub max_ihave_length: usize,
    /// Max ids accepted in a single outgoing IWANT.
    pub max_iwant_length: usize,
    /// Replace mesh with all topic peers on publish.
    pub flood_publish: bool,
    /// Attach signatures outbound.
    pub sign_messages: bool,
    /// Require/verify signatures inbound.
    pub validate_messages: bool,
    /// Enforce `from == SHA-256(key)`.
    pub strict_signature_validation: bool,

    /// Target mesh degree.
    pub mesh_d: usize,
    /// Low watermark; top up when mesh falls below this.
    pub mesh_d_lo: usize,
    /// High watermark; shed when mesh exceeds this.
    pub mesh_d_hi: usize,
    /// Gossip fanout — peers per topic contacted with IHAVE each heartbeat.
    pub mesh_d_lazy: usize,
    /// Minimum outbound peers maintained in each mesh.
    pub mesh_d_out: usize,
    /// Top-by-score cutoff used when narrowing candidate pools.
    pub mesh_d_score: usize,

    pub gossip_threshold: f64,
    pub publish_threshold: f64,
    pub graylist_threshold: f64,
    pub accept_px_threshold: f64,

    /// How long a disconnected peer's score state is retained before reaping.
    pub retain_score: Duration,
    /// Period between `PeerScorer::Decay()` having effect.
    pub decay_interval: Duration,
    /// Counters below this magnitude are clamped to zero on decay.
    pub decay_to_zero: f64,

    /// Ticks between opportunistic-graft passes.
    pub opportunistic_graft_ticks: u64,
    /// Max peers opportunistically grafted per topic per pass.
    pub opportunistic_graft_peers: usize,
    /// Median-mesh-score threshold below which opportunistic graft triggers.
    pub opportunistic_graft_threshold: f64,

    /// Heartbeat ticks slower than this log a warning.
    pub slow_heartbeat_warning: Duration,

    /// Deadline for connect+open on an outbound stream.
    pub stream_open_deadline: Duration,
    /// Deadline for a single outbound write.
    pub stream_write_deadline: Duration,
    /// Deadline for reading one inbound RPC frame.
    pub stream_read_deadline: Duration,

    /// Capacity of each local subscription's delivery queue.
    pub subscription_queue_capacity: usize,
    /// Capacity of the bounded per-peer outbound send queue.
    pub peer_send_queue_capacity: usize,

    /// Timeout applied to `ReqRespService::request`.
    pub request_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_message_size: 1024 * 1024,
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_initial_delay: Duration::from_millis(100),
            history_length: 5,
            history_gossip: 3,
            fanout_ttl: Duration::from_secs(60),
            seen_ttl: Duration::from_secs(120),
            seen_cache_capacity: 100_000,
            prune_backoff: Duration::from_secs(60),
            iwant_followup_time: Duration::from_secs(3),
            max_ihave_length: 5000,
            max_iwant_length: 5000,
            flood_publish: false,
            sign_messages: true,
            validate_messages: true,
            strict_signature_validation: false,

            mesh_d: 6,
            mesh_d_lo: 4,
            mesh_d_hi: 12,
            mesh_d_lazy: 6,
            mesh_d_out: 2,
            mesh_d_score: 4,

            gossip_threshold: -500.0,
            publish_threshold: -1000.0,
            graylist_threshold: -2500.0,
            accept_px_threshold: 10.0,

            retain_score: Duration::from_secs(10 * 60),
            decay_interval: Duration::from_secs(1),
            decay_to_zero: 0.01,

            opportunistic_graft_ticks: 60,
            opportunistic_graft_peers: 2,
            opportunistic_graft_threshold: 0.0,

            slow_heartbeat_warning: Duration::from_millis(100),

            stream_open_deadline: Duration::from_secs(10),
            stream_write_deadline: Duration::from_secs(10),
            stream_read_deadline: Duration::from_secs(30),

            subscription_queue_capacity: 100,
            peer_send_queue_capacity: 100,

            request_timeout: Duration::from_secs(10),
        }
    }
}

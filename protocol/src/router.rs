//! # Router (§4.5)
//!
//! The public surface: `Start`/`Stop`/`Join`/`Leave`/`Subscribe`/`Publish`/
//! `HandleRPC`. Owns the wire codec, the per-peer send queues, and wires
//! `MeshManager`, `PeerScorer`, `MessageCache`, `SeenCache`, and
//! `IWantTracker` together. Never a singleton — constructed directly with
//! `Router::new(endpoint, config, keypair)` per topic (§9).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::cache::{IWantTracker, MessageCache, SeenCache};
use crate::config::{RouterConfig, REALM_TOPIC_PREFIX};
use crate::crypto::{sign_message, verify_message, KeyType, NodeKeypair};
use crate::endpoint::{Endpoint, RealmContext};
use crate::error::RouterError;
use crate::heartbeat::{Heartbeat, HeartbeatConfig};
use crate::identity::NodeId;
use crate::mesh::{MeshManager, MeshParams};
use crate::message::{CacheEntry, Message, MessageId};
use crate::score::PeerScorer;
use crate::wire::{ControlGraft, ControlIHave, ControlIWant, ControlPrune, Rpc, SubscriptionChange, WireMessage};

/// A local subscriber handle: a bounded delivery queue plus a cancel token.
pub struct Subscription {
    pub topic: String,
    pub receiver: mpsc::Receiver<Arc<Message>>,
    cancel: mpsc::Sender<()>,
}

impl Subscription {
    /// Unregisters this subscription and closes its queue.
    pub async fn cancel(self) {
        let _ = self.cancel.send(()).await;
    }
}

struct LocalSub {
    sender: mpsc::Sender<Arc<Message>>,
}

struct RouterState {
    local_subs: HashMap<String, Vec<LocalSub>>,
    peer_queues: HashMap<NodeId, mpsc::Sender<Rpc>>,
    seq: AtomicU64,
}

pub struct Router {
    endpoint: Arc<dyn Endpoint>,
    config: RouterConfig,
    keypair: Option<NodeKeypair>,
    mesh: Arc<MeshManager>,
    scorer: Arc<PeerScorer>,
    cache: Arc<RwLock<MessageCache>>,
    seen: Arc<RwLock<SeenCache>>,
    iwant: Arc<RwLock<IWantTracker>>,
    heartbeat: Arc<Heartbeat>,
    state: RwLock<RouterState>,
    started: AtomicBool,
    shutdown: RwLock<Option<watch::Sender<bool>>>,
}

impl Router {
    pub fn new(endpoint: Arc<dyn Endpoint>, config: RouterConfig, keypair: Option<NodeKeypair>) -> Arc<Self> {
        Self::with_direct_peers(endpoint, config, keypair, HashSet::new())
    }

    pub fn with_direct_peers(
        endpoint: Arc<dyn Endpoint>,
        config: RouterConfig,
        keypair: Option<NodeKeypair>,
        direct_peers: HashSet<NodeId>,
    ) -> Arc<Self> {
        let mesh_params = MeshParams {
            d: config.mesh_d,
            d_lo: config.mesh_d_lo,
            d_hi: config.mesh_d_hi,
            d_lazy: config.mesh_d_lazy,
            d_out: config.mesh_d_out,
            d_score: config.mesh_d_score,
            fanout_ttl: config.fanout_ttl,
            prune_backoff: config.prune_backoff,
        };
        let mesh = Arc::new(MeshManager::new(mesh_params, direct_peers));
        let scorer = Arc::new(PeerScorer::new(
            config.gossip_threshold,
            config.publish_threshold,
            config.graylist_threshold,
            config.accept_px_threshold,
            config.retain_score,
            config.decay_interval,
            config.decay_to_zero,
        ));
        let cache = Arc::new(RwLock::new(MessageCache::new(config.history_length, config.history_gossip)));
        let seen = Arc::new(RwLock::new(SeenCache::new(config.seen_ttl, config.seen_cache_capacity)));
        let iwant = Arc::new(RwLock::new(IWantTracker::new()));

        let heartbeat_config = HeartbeatConfig {
            interval: config.heartbeat_interval,
            initial_delay: config.heartbeat_initial_delay,
            max_ihave_length: config.max_ihave_length,
            iwant_followup_time: config.iwant_followup_time,
            prune_backoff: config.prune_backoff,
            slow_heartbeat_warning: config.slow_heartbeat_warning,
            opportunistic_graft_ticks: config.opportunistic_graft_ticks,
            opportunistic_graft_peers: config.opportunistic_graft_peers,
            opportunistic_graft_threshold: config.opportunistic_graft_threshold,
        };
        let heartbeat = Arc::new(Heartbeat::new(
            Arc::clone(&mesh),
            Arc::clone(&scorer),
            Arc::clone(&cache),
            Arc::clone(&iwant),
            heartbeat_config,
        ));

        Arc::new(Self {
            endpoint,
            config,
            keypair,
            mesh,
            scorer,
            cache,
            seen,
            iwant,
            heartbeat,
            state: RwLock::new(RouterState {
                local_subs: HashMap::new(),
                peer_queues: HashMap::new(),
                seq: AtomicU64::new(1),
            }),
            started: AtomicBool::new(false),
            shutdown: RwLock::new(None),
        })
    }

    /// Idempotent. Installs the protocol handler, registers the
    /// connect-callback, and starts the heartbeat task.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let (tx, rx) = watch::channel(false);
        *self.shutdown.write() = Some(tx);

        let this = Arc::clone(self);
        self.endpoint.register_connection_callback(Arc::new(move |id, outbound| {
            this.mesh.add_peer(id, outbound);
            this.scorer.add_peer(id, None);
            this.send_initial_snapshot(id);
        }));

        let this = Arc::clone(self);
        self.endpoint.set_protocol_handler(
            crate::config::PROTOCOL_ID_GOSSIPSUB,
            Arc::new(move |peer, stream| {
                let this = Arc::clone(&this);
                tokio::spawn(async move {
                    this.handle_inbound_stream(peer, stream).await;
                });
            }),
        );

        let this = Arc::clone(self);
        let mut shutdown_rx = rx;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(this.config.heartbeat_initial_delay) => {}
                _ = shutdown_rx.changed() => return,
            }
            loop {
                if *shutdown_rx.borrow() {
                    return;
                }
                let started = std::time::Instant::now();
                this.run_heartbeat_tick();
                let elapsed = started.elapsed();
                if elapsed >= this.config.slow_heartbeat_warning {
                    warn!(elapsed_ms = elapsed.as_millis() as u64, "heartbeat tick ran slow");
                }
                tokio::select! {
                    _ = tokio::time::sleep(this.config.heartbeat_interval) => {}
                    _ = shutdown_rx.changed() => return,
                }
            }
        });
    }

    /// Runs one heartbeat tick over the currently subscribed topics and
    /// translates the outcome into GRAFT/PRUNE/IHAVE wire sends.
    fn run_heartbeat_tick(self: &Arc<Self>) {
        let topics: Vec<String> = {
            let state = self.state.read();
            state.local_subs.keys().cloned().collect()
        };
        let outcome = self.heartbeat.tick(&topics);

        for (topic, peer) in outcome.grafts {
            self.scorer.graft(&peer, &topic);
            self.enqueue(peer, Rpc { graft: vec![ControlGraft { topic }], ..Default::default() });
        }
        for (topic, peer, px, backoff) in outcome.prunes {
            self.scorer.prune(&peer, &topic);
            let prune = ControlPrune {
                topic,
                backoff_secs: backoff.as_secs(),
                peers: px.iter().map(|p| *p.as_bytes()).collect(),
            };
            self.enqueue(peer, Rpc { prune: vec![prune], ..Default::default() });
        }
        for (peer, topic, ids) in outcome.ihave {
            let ids = ids.iter().map(|id| *id.as_bytes()).collect();
            self.enqueue(peer, Rpc { ihave: vec![ControlIHave { topic, ids }], ..Default::default() });
        }
    }

    /// Idempotent. Cancels the heartbeat, removes the protocol handler, and
    /// closes every local subscription channel.
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.shutdown.write().take() {
            let _ = tx.send(true);
        }
        self.endpoint.remove_protocol_handler(crate::config::PROTOCOL_ID_GOSSIPSUB);
        self.state.write().local_subs.clear();
    }

    async fn handle_inbound_stream(self: Arc<Self>, peer: NodeId, mut stream: Box<dyn crate::endpoint::Stream>) {
        stream.set_read_deadline(self.config.stream_read_deadline);
        let bytes = match crate::wire::read_frame(&mut stream).await {
            Ok(b) => b,
            Err(e) => {
                debug!(peer = %peer, error = %e, "inbound gossipsub frame read failed");
                return;
            }
        };
        let rpc = match Rpc::decode(&bytes) {
            Ok(r) => r,
            Err(e) => {
                debug!(peer = %peer, error = %e, "inbound gossipsub frame decode failed");
                return;
            }
        };
        let _ = stream.close().await;

        let realm_ctx = self.endpoint.connection(&peer).and_then(|conn| conn.realm_context());
        self.handle_rpc(peer, rpc, move |topic| is_realm_authorized(realm_ctx.as_deref(), topic));
    }

    /// Sends a single RPC of `subscribe=true` entries for every currently
    /// subscribed topic, exactly once per peer (§4.5's initial subscription
    /// snapshot); a per-peer flag, cleared only on `remove_peer`, guards the
    /// one-time send.
    fn send_initial_snapshot(self: &Arc<Self>, peer: NodeId) {
        if !self.mesh.mark_snapshot_sent(&peer) {
            return;
        }
        let topics: Vec<String> = {
            let state = self.state.read();
            state.local_subs.keys().cloned().collect()
        };
        if topics.is_empty() {
            return;
        }
        let subscriptions = topics
            .into_iter()
            .map(|topic| SubscriptionChange { topic, subscribe: true })
            .collect();
        self.enqueue(peer, Rpc { subscriptions, ..Default::default() });
    }

    fn enqueue(self: &Arc<Self>, peer: NodeId, rpc: Rpc) {
        if rpc.is_empty() {
            return;
        }
        let sender = {
            let mut state = self.state.write();
            state.peer_queues.get(&peer).cloned()
        };
        let sender = match sender {
            Some(s) => s,
            None => self.spawn_peer_worker(peer),
        };
        if sender.try_send(rpc).is_err() {
            debug!(peer = %peer, "peer send queue full or closed, dropping RPC");
        }
    }

    fn spawn_peer_worker(self: &Arc<Self>, peer: NodeId) -> mpsc::Sender<Rpc> {
        let (tx, mut rx) = mpsc::channel::<Rpc>(self.config.peer_send_queue_capacity);
        self.state.write().peer_queues.insert(peer, tx.clone());

        let endpoint = Arc::clone(&self.endpoint);
        let config = self.config.clone();
        tokio::spawn(async move {
            while let Some(rpc) = rx.recv().await {
                let Some(conn) = endpoint.connection(&peer) else {
                    continue;
                };
                let opened = tokio::time::timeout(
                    config.stream_open_deadline,
                    conn.open_stream(crate::config::PROTOCOL_ID_GOSSIPSUB),
                )
                .await;
                let Ok(Ok(mut stream)) = opened else {
                    debug!(peer = %peer, "failed to open gossipsub stream");
                    continue;
                };
                stream.set_write_deadline(config.stream_write_deadline);
                let Ok(encoded) = rpc.encode() else { continue };
                if let Err(e) = crate::wire::write_frame(&mut stream, &encoded).await {
                    debug!(peer = %peer, error = %e, "failed to write gossipsub frame");
                    continue;
                }
                let _ = stream.close_write().await;
            }
        });
        tx
    }

    pub fn remove_peer(self: &Arc<Self>, peer: &NodeId) {
        self.mesh.remove_peer(peer);
        self.scorer.remove_peer(peer);
        self.state.write().peer_queues.remove(peer);
    }

    /// This node's own id, as reported by the endpoint it was constructed with.
    pub fn local_id(&self) -> NodeId {
        self.endpoint.id()
    }

    /// Number of currently connected peer connections.
    pub fn connected_peer_count(&self) -> usize {
        self.endpoint.connections().len()
    }

    /// Topics with at least one local subscriber or a non-empty mesh.
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.state.read().local_subs.keys().cloned().collect()
    }

    /// Current fanout membership for `topic`.
    pub fn fanout_peers(&self, topic: &str) -> Vec<NodeId> {
        self.mesh.fanout_peers(topic)
    }

    /// Marks `topic` subscribed, joins the mesh, broadcasts the subscribe
    /// change, and sends GRAFT to every peer the mesh added.
    pub fn join(self: &Arc<Self>, topic: &str) {
        let added = self.mesh.join(topic, Some(&self.scorer));
        self.broadcast_subscription(topic, true);
        for peer in added {
            self.scorer.graft(&peer, topic);
            self.enqueue(peer, Rpc { graft: vec![ControlGraft { topic: topic.to_string() }], ..Default::default() });
        }
    }

    /// Leaves the mesh for `topic`, sends PRUNE (with PX) to former
    /// members, and broadcasts the unsubscribe change.
    pub fn leave(self: &Arc<Self>, topic: &str) {
        let former = self.mesh.leave(topic);
        for peer in &former {
            self.scorer.prune(peer, topic);
            let px = self.mesh.get_px_peers(topic, peer, 10, Some(&self.scorer));
            let prune = ControlPrune {
                topic: topic.to_string(),
                backoff_secs: self.config.prune_backoff.as_secs(),
                peers: px.iter().map(|p| *p.as_bytes()).collect(),
            };
            self.enqueue(*peer, Rpc { prune: vec![prune], ..Default::default() });
        }
        self.broadcast_subscription(topic, false);
    }

    fn broadcast_subscription(self: &Arc<Self>, topic: &str, subscribe: bool) {
        let peers: Vec<NodeId> = self.endpoint.connections().iter().map(|c| c.remote_id()).collect();
        for peer in peers {
            self.enqueue(
                peer,
                Rpc {
                    subscriptions: vec![SubscriptionChange { topic: topic.to_string(), subscribe }],
                    ..Default::default()
                },
            );
        }
    }

    /// Joins `topic` if not already joined, allocates a bounded delivery
    /// queue, and registers it. Multiple subscriptions per topic are
    /// permitted; each receives every message.
    pub fn subscribe(self: &Arc<Self>, topic: &str) -> Subscription {
        let already_subscribed = {
            let state = self.state.read();
            state.local_subs.contains_key(topic)
        };
        if !already_subscribed {
            self.join(topic);
        }

        let (tx, rx) = mpsc::channel(self.config.subscription_queue_capacity);
        let (cancel_tx, mut cancel_rx) = mpsc::channel::<()>(1);

        {
            let mut state = self.state.write();
            state.local_subs.entry(topic.to_string()).or_default().push(LocalSub { sender: tx.clone() });
        }

        let this = Arc::clone(self);
        let topic_owned = topic.to_string();
        let sub_sender = tx;
        tokio::spawn(async move {
            let _ = cancel_rx.recv().await;
            let mut state = this.state.write();
            if let Some(subs) = state.local_subs.get_mut(&topic_owned) {
                subs.retain(|s| !s.sender.same_channel(&sub_sender));
            }
        });

        Subscription { topic: topic.to_string(), receiver: rx, cancel: cancel_tx }
    }

    /// Rejects if `data` exceeds `max_message_size`. Signs (if enabled and a
    /// keypair is present), marks the id seen, caches, delivers locally, and
    /// forwards to mesh peers (or fanout peers if not locally subscribed).
    pub fn publish(self: &Arc<Self>, topic: &str, data: Vec<u8>, from: NodeId) -> Result<MessageId, RouterError> {
        if data.len() > self.config.max_message_size {
            return Err(RouterError::MessageTooLarge(data.len()));
        }

        let seq = self.state.read().seq.fetch_add(1, Ordering::SeqCst);
        let mut message = Message::new(topic, from, seq, data);

        if self.config.sign_messages {
            if let Some(keypair) = &self.keypair {
                let sig = sign_message(keypair, topic, &from, seq, &message.data);
                message.signature = Some(sig);
                message.key = Some(keypair.public_key_bytes());
                message.key_type = Some(keypair.key_type());
            }
        }

        let id = message.id();
        self.seen.write().add(id);
        self.cache.write().put(CacheEntry {
            message: message.clone(),
            received_from: from,
            received_at: std::time::Instant::now(),
            validated: true,
            valid: true,
        });
        self.deliver_locally(topic, &message);

        let subscribed = {
            let state = self.state.read();
            state.local_subs.contains_key(topic)
        };
        let targets = if self.config.flood_publish {
            self.mesh.fanout_peers(topic)
        } else if subscribed {
            self.mesh_peers(topic)
        } else {
            self.mesh.fanout_peers(topic)
        };

        let wire = WireMessage::from(&message);
        for peer in targets {
            self.enqueue(peer, Rpc { messages: vec![wire.clone()], ..Default::default() });
        }

        Ok(id)
    }

    /// Current mesh membership for `topic`.
    pub fn mesh_peers(&self, topic: &str) -> Vec<NodeId> {
        self.mesh.mesh_peers(topic)
    }

    fn deliver_locally(&self, topic: &str, message: &Message) {
        let state = self.state.read();
        if let Some(subs) = state.local_subs.get(topic) {
            let arc = Arc::new(message.clone());
            for sub in subs {
                if sub.sender.try_send(Arc::clone(&arc)).is_err() {
                    warn!(topic = %topic, "subscriber queue full, dropping message");
                }
            }
        }
    }

    /// Dispatches one inbound RPC from `from` on a connection whose realm
    /// authorization is described by `realm_authorized`.
    pub fn handle_rpc(self: &Arc<Self>, from: NodeId, rpc: Rpc, realm_authorized: impl Fn(&str) -> bool) {
        for change in &rpc.subscriptions {
            self.mesh.note_peer_topic(&from, &change.topic, change.subscribe);
        }

        for wire_msg in rpc.messages {
            self.handle_inbound_message(from, wire_msg, &realm_authorized);
        }

        for ihave in rpc.ihave {
            self.handle_ihave(from, ihave);
        }
        for iwant in rpc.iwant {
            self.handle_iwant(from, iwant);
        }
        for graft in rpc.graft {
            self.handle_graft(from, graft);
        }
        for prune in rpc.prune {
            self.handle_prune(from, prune);
        }
    }

    fn handle_inbound_message(self: &Arc<Self>, from: NodeId, wire_msg: WireMessage, realm_authorized: &impl Fn(&str) -> bool) {
        let message = wire_msg.into_message();
        let id = message.id();

        if message.topic.starts_with(REALM_TOPIC_PREFIX) && !realm_authorized(&message.topic) {
            return;
        }

        let was_first_deliverer = !self.cache.read().has(&id);
        if !self.seen.write().add(id) {
            self.scorer.duplicate_message(&from, &message.topic, was_first_deliverer);
            return;
        }

        if message.validate_basic(self.config.max_message_size).is_err() {
            self.scorer.validate_message(&from, &message.topic, true, false);
            return;
        }

        let valid = self.validate_signature(&message);
        self.scorer.validate_message(&from, &message.topic, true, valid);
        if !valid {
            return;
        }

        self.cache.write().put(CacheEntry {
            message: message.clone(),
            received_from: from,
            received_at: std::time::Instant::now(),
            validated: true,
            valid: true,
        });
        self.iwant.write().fulfill(&id);
        self.deliver_locally(&message.topic, &message);

        let wire = WireMessage::from(&message);
        for peer in self.mesh_peers(&message.topic) {
            if peer != from {
                self.enqueue(peer, Rpc { messages: vec![wire.clone()], ..Default::default() });
            }
        }
    }

    fn validate_signature(&self, message: &Message) -> bool {
        if !self.config.validate_messages {
            return true;
        }
        let (Some(signature), Some(key)) = (&message.signature, &message.key) else {
            return false;
        };
        if signature.is_empty() || key.is_empty() {
            return false;
        }
        let key_type = match message.key_type {
            Some(KeyType::Unknown) | None => KeyType::infer_from_key_len(key.len()),
            Some(kt) => kt,
        };
        if self.config.strict_signature_validation {
            let expected = crate::crypto::sha256(key);
            if expected.as_slice() != message.from.as_bytes() {
                return false;
            }
        }
        verify_message(key_type, key, &message.topic, &message.from, message.seq, &message.data, signature).is_ok()
    }

    fn handle_ihave(self: &Arc<Self>, from: NodeId, ihave: ControlIHave) {
        if self.scorer.is_below_gossip_threshold(&from) {
            return;
        }
        let mut wanted = Vec::new();
        for id_bytes in ihave.ids {
            let id = MessageId::from(id_bytes);
            if self.cache.read().has(&id) || self.seen.read().has(&id) {
                continue;
            }
            self.iwant.write().track(id, from);
            wanted.push(*id.as_bytes());
            if wanted.len() >= self.config.max_iwant_length {
                break;
            }
        }
        if !wanted.is_empty() {
            self.enqueue(from, Rpc { iwant: vec![ControlIWant { ids: wanted }], ..Default::default() });
        }
    }

    fn handle_iwant(self: &Arc<Self>, from: NodeId, iwant: ControlIWant) {
        let mut messages = Vec::new();
        for id_bytes in iwant.ids {
            let id = MessageId::from(id_bytes);
            if let Some(msg) = self.cache.read().get_message(&id) {
                messages.push(WireMessage::from(msg));
            }
        }
        if !messages.is_empty() {
            self.enqueue(from, Rpc { messages, ..Default::default() });
        }
    }

    fn handle_graft(self: &Arc<Self>, from: NodeId, graft: ControlGraft) {
        let subscribed = {
            let state = self.state.read();
            state.local_subs.contains_key(&graft.topic)
        };
        if !subscribed {
            self.enqueue(
                from,
                Rpc {
                    prune: vec![ControlPrune { topic: graft.topic, backoff_secs: 0, peers: vec![] }],
                    ..Default::default()
                },
            );
            return;
        }
        if self.scorer.is_below_graylist_threshold(&from) {
            let px = self.mesh.get_px_peers(&graft.topic, &from, 10, Some(&self.scorer));
            self.enqueue(
                from,
                Rpc {
                    prune: vec![ControlPrune {
                        topic: graft.topic,
                        backoff_secs: self.config.prune_backoff.as_secs(),
                        peers: px.iter().map(|p| *p.as_bytes()).collect(),
                    }],
                    ..Default::default()
                },
            );
            return;
        }
        if self.mesh.graft(&from, &graft.topic, Some(&self.scorer)).is_ok() {
            self.scorer.graft(&from, &graft.topic);
        }
    }

    fn handle_prune(self: &Arc<Self>, from: NodeId, prune: ControlPrune) {
        self.mesh.prune(&from, &prune.topic, std::time::Duration::from_secs(prune.backoff_secs));
        self.scorer.prune(&from, &prune.topic);
        let peer_ids: Vec<NodeId> = prune.peers.iter().map(|b| NodeId::from_bytes(*b)).collect();
        let _ = self.mesh.handle_px(&from, &peer_ids, Some(&self.scorer));
    }
}

/// `realm/{id}/...` topics require a valid realm context whose `realm_id()`
/// matches `{id}`; everything else is always authorized.
fn is_realm_authorized(realm_ctx: Option<&dyn RealmContext>, topic: &str) -> bool {
    let Some(rest) = topic.strip_prefix(REALM_TOPIC_PREFIX) else {
        return true;
    };
    let realm_id = rest.split('/').next().unwrap_or("");
    match realm_ctx {
        Some(ctx) => ctx.is_valid() && ctx.realm_id() == realm_id,
        None => false,
    }
}

impl MessageId {
    fn from(bytes: [u8; 40]) -> Self {
        // Mirrors `MessageId::new`'s layout (`from ‖ seq_be64`) without
        // re-deriving it from component parts — the wire already carries
        // the id in its canonical encoding.
        let from = NodeId::try_from_slice(&bytes[..32]).expect("32-byte prefix");
        let mut seq_bytes = [0u8; 8];
        seq_bytes.copy_from_slice(&bytes[32..]);
        MessageId::new(&from, u64::from_be_bytes(seq_bytes))
    }
}

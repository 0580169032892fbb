//! # Prometheus Metrics
//!
//! Exposes operational metrics for the mesh relay node. Scraped by Prometheus
//! at the `/metrics` HTTP endpoint on the configured metrics port.
//!
//! All metrics are registered in a dedicated [`prometheus::Registry`] so they
//! do not collide with any default global registry consumers.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Holds all Prometheus metric handles for the node.
///
/// Clone-friendly (the handles it wraps are themselves `Arc`-backed) so it
/// can be shared across request handlers and background tasks.
#[derive(Clone)]
#[allow(dead_code)]
pub struct NodeMetrics {
    /// Prometheus registry that owns all metrics below.
    registry: Registry,
    /// Number of currently connected peers (any topic).
    pub connected_peers: IntGauge,
    /// Current mesh size, labeled by topic.
    pub mesh_peers: IntGaugeVec,
    /// Current fanout peer-set size, labeled by topic.
    pub fanout_peers: IntGaugeVec,
    /// Total GRAFT messages sent, labeled by topic.
    pub graft_sent_total: IntCounterVec,
    /// Total PRUNE messages sent, labeled by topic.
    pub prune_sent_total: IntCounterVec,
    /// Total IHAVE messages sent.
    pub ihave_sent_total: IntCounter,
    /// Total IWANT messages sent.
    pub iwant_sent_total: IntCounter,
    /// Total messages published locally.
    pub messages_published_total: IntCounter,
    /// Total messages delivered to local subscribers.
    pub messages_delivered_total: IntCounter,
    /// Total inbound messages rejected by validation or scoring.
    pub messages_rejected_total: IntCounter,
    /// Current number of entries in the message cache.
    pub message_cache_size: IntGauge,
    /// Current number of entries in the seen-message dedup cache.
    pub seen_cache_size: IntGauge,
    /// Heartbeat tick duration in seconds.
    pub heartbeat_duration_seconds: Histogram,
    /// Distribution of peer scores at each heartbeat decay.
    pub peer_score: HistogramVec,
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("meshrelay".into()), None)
            .expect("failed to create prometheus registry");

        let connected_peers =
            IntGauge::new("connected_peers", "Number of currently connected peers")
                .expect("metric creation");
        registry
            .register(Box::new(connected_peers.clone()))
            .expect("metric registration");

        let mesh_peers = IntGaugeVec::new(
            Opts::new("mesh_peers", "Current mesh size per topic"),
            &["topic"],
        )
        .expect("metric creation");
        registry
            .register(Box::new(mesh_peers.clone()))
            .expect("metric registration");

        let fanout_peers = IntGaugeVec::new(
            Opts::new("fanout_peers", "Current fanout peer-set size per topic"),
            &["topic"],
        )
        .expect("metric creation");
        registry
            .register(Box::new(fanout_peers.clone()))
            .expect("metric registration");

        let graft_sent_total = IntCounterVec::new(
            Opts::new("graft_sent_total", "Total GRAFT control messages sent"),
            &["topic"],
        )
        .expect("metric creation");
        registry
            .register(Box::new(graft_sent_total.clone()))
            .expect("metric registration");

        let prune_sent_total = IntCounterVec::new(
            Opts::new("prune_sent_total", "Total PRUNE control messages sent"),
            &["topic"],
        )
        .expect("metric creation");
        registry
            .register(Box::new(prune_sent_total.clone()))
            .expect("metric registration");

        let ihave_sent_total =
            IntCounter::new("ihave_sent_total", "Total IHAVE control messages sent")
                .expect("metric creation");
        registry
            .register(Box::new(ihave_sent_total.clone()))
            .expect("metric registration");

        let iwant_sent_total =
            IntCounter::new("iwant_sent_total", "Total IWANT control messages sent")
                .expect("metric creation");
        registry
            .register(Box::new(iwant_sent_total.clone()))
            .expect("metric registration");

        let messages_published_total = IntCounter::new(
            "messages_published_total",
            "Total messages published locally",
        )
        .expect("metric creation");
        registry
            .register(Box::new(messages_published_total.clone()))
            .expect("metric registration");

        let messages_delivered_total = IntCounter::new(
            "messages_delivered_total",
            "Total messages delivered to local subscribers",
        )
        .expect("metric creation");
        registry
            .register(Box::new(messages_delivered_total.clone()))
            .expect("metric registration");

        let messages_rejected_total = IntCounter::new(
            "messages_rejected_total",
            "Total inbound messages rejected by validation or scoring",
        )
        .expect("metric creation");
        registry
            .register(Box::new(messages_rejected_total.clone()))
            .expect("metric registration");

        let message_cache_size = IntGauge::new(
            "message_cache_size",
            "Current number of entries in the message cache",
        )
        .expect("metric creation");
        registry
            .register(Box::new(message_cache_size.clone()))
            .expect("metric registration");

        let seen_cache_size = IntGauge::new(
            "seen_cache_size",
            "Current number of entries in the seen-message dedup cache",
        )
        .expect("metric creation");
        registry
            .register(Box::new(seen_cache_size.clone()))
            .expect("metric registration");

        let heartbeat_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "heartbeat_duration_seconds",
                "Heartbeat tick duration in seconds",
            )
            .buckets(vec![
                0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
            ]),
        )
        .expect("metric creation");
        registry
            .register(Box::new(heartbeat_duration_seconds.clone()))
            .expect("metric registration");

        let peer_score = HistogramVec::new(
            HistogramOpts::new("peer_score", "Distribution of peer scores per topic")
                .buckets(vec![-100.0, -50.0, -10.0, -1.0, 0.0, 1.0, 10.0, 50.0, 100.0]),
            &["topic"],
        )
        .expect("metric creation");
        registry
            .register(Box::new(peer_score.clone()))
            .expect("metric registration");

        Self {
            registry,
            connected_peers,
            mesh_peers,
            fanout_peers,
            graft_sent_total,
            prune_sent_total,
            ihave_sent_total,
            iwant_sent_total,
            messages_published_total,
            messages_delivered_total,
            messages_rejected_total,
            message_cache_size,
            seen_cache_size,
            heartbeat_duration_seconds,
            peer_score,
        }
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer).expect("prometheus output is valid utf-8"))
    }
}

/// Shared metrics state passed to axum handlers via extension.
pub type SharedMetrics = Arc<NodeMetrics>;

/// Axum handler that renders `/metrics` in Prometheus text format.
///
/// Returns HTTP 500 if encoding fails (should never happen in practice).
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

//! # REST + WebSocket API
//!
//! Builds the axum router that exposes the relay node's HTTP interface.
//! All endpoints share application state through axum's `State` extractor.
//!
//! ## Endpoints
//!
//! | Method | Path             | Description                              |
//! |--------|------------------|-------------------------------------------|
//! | GET    | `/health`        | Liveness probe                             |
//! | GET    | `/status`        | Node status summary                        |
//! | GET    | `/topics`        | Subscribed topics and mesh/fanout sizes    |
//! | POST   | `/topics/:topic` | Subscribe to a topic                       |
//! | POST   | `/publish/:topic`| Publish a message to a topic               |
//! | GET    | `/events`        | WebSocket stream of delivered messages     |

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use meshrelay_protocol::identity::NodeId;
use meshrelay_protocol::router::Router as MeshRouter;

use crate::metrics::SharedMetrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared application state available to all request handlers.
///
/// Cheap to clone — everything behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// The node's reported version string.
    pub version: String,
    /// The routing engine this node wraps.
    pub router: Arc<MeshRouter>,
    /// Broadcast channel for live delivered-message notifications.
    pub event_tx: broadcast::Sender<DeliveredMessage>,
    /// Reference to Prometheus metrics for in-handler recording.
    pub metrics: SharedMetrics,
}

/// A message delivered to a local subscription, pushed to WebSocket clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveredMessage {
    pub topic: String,
    pub from: String,
    pub seq: u64,
    pub data_len: usize,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the full axum [`Router`] with all API routes, CORS, and tracing.
///
/// The returned router is ready to be served on the configured RPC port.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/topics", get(topics_handler))
        .route("/topics/{topic}", post(subscribe_handler))
        .route("/publish/{topic}", post(publish_handler))
        .route("/events", get(events_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Response Types
// ---------------------------------------------------------------------------

/// Response payload for `GET /status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Node software version.
    pub version: String,
    /// This node's identity, hex-encoded.
    pub node_id: String,
    /// Number of currently connected peers (any topic).
    pub connected_peers: u64,
    /// Number of topics currently subscribed to.
    pub topic_count: u64,
}

/// An entry in the `GET /topics` response.
#[derive(Debug, Serialize)]
pub struct TopicInfo {
    pub topic: String,
    pub mesh_size: usize,
    pub fanout_size: usize,
}

/// Request body for `POST /publish/:topic`.
#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    /// Raw message payload, base64-encoded.
    pub data_base64: String,
}

/// Response payload for `POST /publish/:topic`.
#[derive(Debug, Serialize, Deserialize)]
pub struct PublishResponse {
    pub message_id: String,
}

/// A simple error body returned for 4xx/5xx responses.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health` — returns 200 if the node is alive.
///
/// This is the liveness probe for orchestrators (k8s, systemd, etc.). It
/// intentionally does not check mesh health — that belongs in `/status`.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// `GET /status` — returns node status summary.
async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let resp = StatusResponse {
        version: state.version.clone(),
        node_id: state.router.local_id().to_hex(),
        connected_peers: state.router.connected_peer_count() as u64,
        topic_count: state.router.subscribed_topics().len() as u64,
    };
    Json(resp)
}

/// `GET /topics` — lists subscribed topics with current mesh/fanout sizes.
async fn topics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let topics = state
        .router
        .subscribed_topics()
        .into_iter()
        .map(|topic| {
            let mesh_size = state.router.mesh_peers(&topic).len();
            let fanout_size = state.router.fanout_peers(&topic).len();
            TopicInfo { topic, mesh_size, fanout_size }
        })
        .collect::<Vec<_>>();
    Json(topics)
}

/// `POST /topics/:topic` — subscribes the node to a topic.
///
/// Delivered messages are forwarded to WebSocket clients connected to
/// `/events`, not returned from this call — subscription is fire-and-forget
/// from the HTTP caller's perspective. The node keeps the `Subscription`
/// handle alive for the process lifetime by spawning a task that drains it
/// into the broadcast channel.
async fn subscribe_handler(
    Path(topic): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let mut subscription = state.router.subscribe(&topic);
    let event_tx = state.event_tx.clone();
    tokio::spawn(async move {
        while let Some(message) = subscription.receiver.recv().await {
            let _ = event_tx.send(DeliveredMessage {
                topic: subscription.topic.clone(),
                from: message.from.to_hex(),
                seq: message.seq,
                data_len: message.data.len(),
            });
        }
    });
    (StatusCode::OK, Json(serde_json::json!({ "subscribed": topic })))
}

/// `POST /publish/:topic` — publishes a message to a topic.
///
/// The payload is the publishing node's own identity, matching how a local
/// application using this node as its mesh gateway would publish: no
/// separate "publish as" identity is exposed over the wire.
async fn publish_handler(
    Path(topic): Path<String>,
    State(state): State<AppState>,
    Json(req): Json<PublishRequest>,
) -> impl IntoResponse {
    let data = match base64_decode(&req.data_base64) {
        Ok(bytes) => bytes,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse { error: format!("invalid base64 payload: {e}") }),
            )
                .into_response();
        }
    };

    let local_id: NodeId = state.router.local_id();
    match state.router.publish(&topic, data, local_id) {
        Ok(id) => {
            state.metrics.messages_published_total.inc();
            (StatusCode::OK, Json(PublishResponse { message_id: hex::encode(id.as_bytes()) }))
                .into_response()
        }
        Err(e) => {
            (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: e.to_string() })).into_response()
        }
    }
}

/// `GET /events` — WebSocket upgrade for live delivered-message streaming.
async fn events_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

/// Drives a single WebSocket connection, forwarding broadcast events until
/// the client disconnects or the channel is closed.
async fn handle_ws_connection(mut socket: WebSocket, state: AppState) {
    let mut rx = state.event_tx.subscribe();

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(ev) => {
                        let payload = match serde_json::to_string(&ev) {
                            Ok(s) => s,
                            Err(e) => {
                                tracing::warn!("failed to serialize ws event: {}", e);
                                continue;
                            }
                        };
                        if socket.send(WsMessage::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("ws subscriber lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(_)) => {
                        // Client messages are ignored — this is a push-only channel.
                    }
                    _ => break,
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// base64
// ---------------------------------------------------------------------------

fn base64_decode(input: &str) -> Result<Vec<u8>, String> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(input)
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use meshrelay_protocol::config::RouterConfig;
    use meshrelay_protocol::crypto::{sha256_array, NodeKeypair};

    use crate::metrics::NodeMetrics;
    use crate::transport::TcpEndpoint;

    #[test]
    fn base64_roundtrip() {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"hello mesh");
        let decoded = base64_decode(&encoded).unwrap();
        assert_eq!(decoded, b"hello mesh");
    }

    #[test]
    fn base64_decode_rejects_garbage() {
        assert!(base64_decode("not valid base64!!!").is_err());
    }

    /// Builds an `AppState` wrapping a real `Router` over a loopback
    /// `TcpEndpoint` bound to an ephemeral port — no peers ever connect, so
    /// this only exercises the HTTP surface, not mesh formation.
    async fn test_state() -> AppState {
        let keypair = NodeKeypair::generate_ed25519();
        let node_id = NodeId::from_bytes(sha256_array(&keypair.public_key_bytes()));
        let endpoint = TcpEndpoint::bind(node_id, "127.0.0.1:0".parse().unwrap())
            .await
            .expect("bind loopback endpoint");
        let router = MeshRouter::new(endpoint, RouterConfig::default(), Some(keypair));
        router.start();
        let (event_tx, _rx) = broadcast::channel(16);
        AppState {
            version: "test".to_string(),
            router,
            event_tx,
            metrics: Arc::new(NodeMetrics::new()),
        }
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let app = create_router(test_state().await);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn status_endpoint_reports_node_id_and_zero_peers() {
        let state = test_state().await;
        let expected_id = state.router.local_id().to_hex();
        let app = create_router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/status")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let status: StatusResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(status.node_id, expected_id);
        assert_eq!(status.connected_peers, 0);
    }

    #[tokio::test]
    async fn subscribe_then_publish_roundtrips_through_http() {
        use base64::Engine;
        let app = create_router(test_state().await);

        let subscribe_response = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/topics/gossip")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(subscribe_response.status(), StatusCode::OK);

        let payload = serde_json::json!({
            "data_base64": base64::engine::general_purpose::STANDARD.encode(b"hello"),
        });
        let publish_response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/publish/gossip")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(publish_response.status(), StatusCode::OK);
        let body = publish_response.into_body().collect().await.unwrap().to_bytes();
        let parsed: PublishResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.message_id.len(), 80); // 40 bytes, hex-encoded
    }

    #[tokio::test]
    async fn publish_rejects_invalid_base64() {
        let app = create_router(test_state().await);
        let payload = serde_json::json!({ "data_base64": "not valid base64!!!" });
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/publish/gossip")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}

//! # Request/Response mode (SPEC_FULL §4.6)
//!
//! A minimal framed request/response service on `app/msg/req/1.0`,
//! independent of `Router`/`MeshManager` — it shares only the wire-framing
//! helpers and the `Endpoint` trait.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::time::timeout;
use tracing::debug;

use crate::config::PROTOCOL_ID_REQ;
use crate::endpoint::{Endpoint, Stream};
use crate::error::ReqRespError;
use crate::identity::NodeId;
use crate::wire::{read_frame, write_frame};

/// Invoked once per inbound request; its return value is written back as
/// the response frame.
pub type RequestHandler = Arc<dyn Fn(NodeId, Vec<u8>) -> Vec<u8> + Send + Sync>;

pub struct ReqRespService {
    endpoint: Arc<dyn Endpoint>,
    handler: RwLock<Option<RequestHandler>>,
}

impl ReqRespService {
    pub fn new(endpoint: Arc<dyn Endpoint>) -> Arc<Self> {
        Arc::new(Self { endpoint, handler: RwLock::new(None) })
    }

    /// Installs the inbound handler and registers the stream handler on the
    /// endpoint. Call once after construction.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.endpoint.set_protocol_handler(
            PROTOCOL_ID_REQ,
            Arc::new(move |peer, stream| {
                let this = Arc::clone(&this);
                tokio::spawn(async move {
                    this.serve(peer, stream).await;
                });
            }),
        );
    }

    pub fn set_handler(&self, handler: RequestHandler) {
        *self.handler.write() = Some(handler);
    }

    async fn serve(self: Arc<Self>, peer: NodeId, mut stream: Box<dyn Stream>) {
        let bytes = match read_frame(&mut stream).await {
            Ok(b) => b,
            Err(e) => {
                debug!(peer = %peer, error = %e, "reqresp inbound read failed");
                return;
            }
        };
        let handler = self.handler.read().clone();
        let response = match handler {
            Some(h) => h(peer, bytes),
            None => Vec::new(),
        };
        if let Err(e) = write_frame(&mut stream, &response).await {
            debug!(peer = %peer, error = %e, "reqresp response write failed");
        }
        let _ = stream.close().await;
    }

    /// Opens a stream, writes one length-prefixed frame, reads one back,
    /// and closes the stream.
    pub async fn request(&self, peer: &NodeId, payload: Vec<u8>, request_timeout: std::time::Duration) -> Result<Vec<u8>, ReqRespError> {
        let fut = self.request_inner(peer, payload);
        match timeout(request_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ReqRespError::Timeout),
        }
    }

    async fn request_inner(&self, peer: &NodeId, payload: Vec<u8>) -> Result<Vec<u8>, ReqRespError> {
        let conn = self
            .endpoint
            .connection(peer)
            .ok_or_else(|| ReqRespError::NoConnection(*peer))?;
        let mut stream = conn
            .open_stream(PROTOCOL_ID_REQ)
            .await
            .map_err(|e| ReqRespError::StreamFailed(e.to_string()))?;
        write_frame(&mut stream, &payload).await.map_err(|e| ReqRespError::StreamFailed(e.to_string()))?;
        stream.close_write().await.map_err(|e| ReqRespError::StreamFailed(e.to_string()))?;
        let response = read_frame(&mut stream).await.map_err(|e| ReqRespError::StreamFailed(e.to_string()))?;
        let _ = stream.close().await;
        Ok(response)
    }
}

// Exercised end to end in protocol/tests/reqresp_notify.rs against
// `InMemoryEndpoint`.

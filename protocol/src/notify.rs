//! # Notify mode (SPEC_FULL §4.7)
//!
//! Fire-and-forget single-frame messages on `app/msg/notify/1.0`.
//! Independent of `Router`/`MeshManager`, sharing only the wire-framing
//! helpers and the `Endpoint` trait.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::PROTOCOL_ID_NOTIFY;
use crate::endpoint::{Endpoint, Stream};
use crate::error::NotifyError;
use crate::identity::NodeId;
use crate::wire::{read_frame, write_frame};

/// Invoked once per received frame. Panics inside the handler are caught
/// and logged, never propagated to the stream-reading task.
pub type NotifyHandler = Arc<dyn Fn(NodeId, Vec<u8>) + Send + Sync>;

pub struct NotifyService {
    endpoint: Arc<dyn Endpoint>,
    handler: RwLock<Option<NotifyHandler>>,
}

impl NotifyService {
    pub fn new(endpoint: Arc<dyn Endpoint>) -> Arc<Self> {
        Arc::new(Self { endpoint, handler: RwLock::new(None) })
    }

    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.endpoint.set_protocol_handler(
            PROTOCOL_ID_NOTIFY,
            Arc::new(move |peer, stream| {
                let this = Arc::clone(&this);
                tokio::spawn(async move {
                    this.serve(peer, stream).await;
                });
            }),
        );
    }

    pub fn set_handler(&self, handler: NotifyHandler) {
        *self.handler.write() = Some(handler);
    }

    async fn serve(self: Arc<Self>, peer: NodeId, mut stream: Box<dyn Stream>) {
        let bytes = match read_frame(&mut stream).await {
            Ok(b) => b,
            Err(e) => {
                debug!(peer = %peer, error = %e, "notify inbound read failed");
                return;
            }
        };
        let _ = stream.close().await;

        let handler = self.handler.read().clone();
        if let Some(h) = handler {
            if std::panic::catch_unwind(AssertUnwindSafe(|| h(peer, bytes))).is_err() {
                warn!(peer = %peer, "notify handler panicked");
            }
        }
    }

    /// Opens a stream, writes one frame, and closes the stream without
    /// waiting for a reply.
    pub async fn notify(&self, peer: &NodeId, payload: Vec<u8>) -> Result<(), NotifyError> {
        let conn = self
            .endpoint
            .connection(peer)
            .ok_or_else(|| NotifyError::NoConnection(*peer))?;
        let mut stream = conn
            .open_stream(PROTOCOL_ID_NOTIFY)
            .await
            .map_err(|e| NotifyError::StreamFailed(e.to_string()))?;
        write_frame(&mut stream, &payload).await.map_err(|e| NotifyError::StreamFailed(e.to_string()))?;
        stream.close_write().await.map_err(|e| NotifyError::StreamFailed(e.to_string()))?;
        let _ = stream.close().await;
        Ok(())
    }
}

// Exercised end to end in protocol/tests/reqresp_notify.rs against
// `InMemoryEndpoint`.

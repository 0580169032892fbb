//! In-process `Endpoint` test double.
//!
//! Backs every node in a test scenario with an in-memory duplex pipe instead
//! of a real socket, so end-to-end mesh/gossip/reqresp/notify behavior can be
//! exercised without touching the network. Every open stream is a fresh
//! `tokio::io::duplex` pair — mirroring how the real transport treats one
//! stream as one connection (open, use, close) rather than multiplexing.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

use meshrelay_protocol::endpoint::{
    Connection, ConnectionCallback, Endpoint, RealmContext, Stream, StreamHandler,
};
use meshrelay_protocol::identity::NodeId;

const DUPLEX_BUF_SIZE: usize = 64 * 1024;

/// A shared registry of [`InMemoryEndpoint`]s a test's nodes are wired into.
pub struct InMemoryNetwork {
    endpoints: Mutex<HashMap<NodeId, Arc<InMemoryEndpoint>>>,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { endpoints: Mutex::new(HashMap::new()) })
    }

    /// Creates and registers a new endpoint for `id` on this network.
    pub fn new_endpoint(self: &Arc<Self>, id: NodeId) -> Arc<InMemoryEndpoint> {
        let endpoint = Arc::new(InMemoryEndpoint {
            id,
            network: Arc::clone(self),
            self_weak: RwLock::new(Weak::new()),
            connections: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            callbacks: RwLock::new(Vec::new()),
        });
        *endpoint.self_weak.write() = Arc::downgrade(&endpoint);
        self.endpoints.lock().unwrap().insert(id, Arc::clone(&endpoint));
        endpoint
    }

    fn get(&self, id: &NodeId) -> Option<Arc<InMemoryEndpoint>> {
        self.endpoints.lock().unwrap().get(id).cloned()
    }
}

pub struct InMemoryEndpoint {
    id: NodeId,
    network: Arc<InMemoryNetwork>,
    self_weak: RwLock<Weak<InMemoryEndpoint>>,
    connections: RwLock<HashMap<NodeId, Arc<InMemoryConnection>>>,
    handlers: RwLock<HashMap<String, StreamHandler>>,
    callbacks: RwLock<Vec<ConnectionCallback>>,
}

impl InMemoryEndpoint {
    fn fire_callbacks(&self, peer: NodeId, outbound: bool) {
        for cb in self.callbacks.read().iter() {
            cb(peer, outbound);
        }
    }

    fn link(self: &Arc<Self>, remote: &Arc<InMemoryEndpoint>) {
        let already_linked = self.connections.read().contains_key(&remote.id);
        if already_linked {
            return;
        }
        let forward = Arc::new(InMemoryConnection { local: Arc::clone(self), remote: Arc::clone(remote) });
        let backward = Arc::new(InMemoryConnection { local: Arc::clone(remote), remote: Arc::clone(self) });
        self.connections.write().insert(remote.id, forward);
        remote.connections.write().insert(self.id, backward);
        self.fire_callbacks(remote.id, true);
        remote.fire_callbacks(self.id, false);
    }
}

#[async_trait]
impl Endpoint for InMemoryEndpoint {
    fn id(&self) -> NodeId {
        self.id
    }

    fn connections(&self) -> Vec<Arc<dyn Connection>> {
        self.connections.read().values().map(|c| Arc::clone(c) as Arc<dyn Connection>).collect()
    }

    fn connection(&self, id: &NodeId) -> Option<Arc<dyn Connection>> {
        self.connections.read().get(id).map(|c| Arc::clone(c) as Arc<dyn Connection>)
    }

    async fn connect(&self, id: &NodeId) -> io::Result<Arc<dyn Connection>> {
        let self_arc = self
            .self_weak
            .read()
            .upgrade()
            .expect("endpoint outlives its own connect() call");
        let remote = self
            .network
            .get(id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown peer in test network"))?;
        self_arc.link(&remote);
        self.connection(id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "link did not register connection"))
    }

    fn set_protocol_handler(&self, protocol_id: &str, handler: StreamHandler) {
        self.handlers.write().insert(protocol_id.to_string(), handler);
    }

    fn remove_protocol_handler(&self, protocol_id: &str) {
        self.handlers.write().remove(protocol_id);
    }

    fn register_connection_callback(&self, callback: ConnectionCallback) {
        self.callbacks.write().push(callback);
    }
}

pub struct InMemoryConnection {
    local: Arc<InMemoryEndpoint>,
    remote: Arc<InMemoryEndpoint>,
}

impl std::fmt::Debug for InMemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryConnection")
            .field("local", &self.local.id)
            .field("remote", &self.remote.id)
            .finish()
    }
}

#[async_trait]
impl Connection for InMemoryConnection {
    fn remote_id(&self) -> NodeId {
        self.remote.id
    }

    fn realm_context(&self) -> Option<Arc<dyn RealmContext>> {
        None
    }

    async fn open_stream(&self, protocol_id: &str) -> io::Result<Box<dyn Stream>> {
        let (local_half, remote_half) = tokio::io::duplex(DUPLEX_BUF_SIZE);
        let handler = self.remote.handlers.read().get(protocol_id).cloned();
        if let Some(handler) = handler {
            let local_id = self.local.id;
            tokio::spawn(async move {
                handler(local_id, Box::new(InMemoryStream::new(remote_half)));
            });
        }
        Ok(Box::new(InMemoryStream::new(local_half)))
    }
}

pub struct InMemoryStream {
    inner: DuplexStream,
    read_deadline: Option<Duration>,
    write_deadline: Option<Duration>,
}

impl InMemoryStream {
    fn new(inner: DuplexStream) -> Self {
        Self { inner, read_deadline: None, write_deadline: None }
    }
}

impl AsyncRead for InMemoryStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for InMemoryStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[async_trait]
impl Stream for InMemoryStream {
    async fn close(&mut self) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        self.inner.shutdown().await
    }

    async fn close_write(&mut self) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        self.inner.shutdown().await
    }

    fn set_read_deadline(&mut self, deadline: Duration) {
        self.read_deadline = Some(deadline);
    }

    fn set_write_deadline(&mut self, deadline: Duration) {
        self.write_deadline = Some(deadline);
    }
}

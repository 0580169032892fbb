//! # TCP transport
//!
//! The only concrete [`Endpoint`] this workspace ships. `meshrelay-protocol`
//! deliberately stops at the `Endpoint`/`Connection`/`Stream` traits (see
//! that crate's `endpoint.rs`) — wiring an actual socket layer is the host
//! binary's job, so it lives here instead.
//!
//! Every call to [`Connection::open_stream`] dials a fresh TCP connection
//! rather than multiplexing streams over one socket. That matches how the
//! router, request/response, and notify services actually use a stream:
//! open, write one frame (or a request/response pair), close. A persistent
//! multiplexed transport would buy nothing here and cost a yamux/quic
//! dependency the rest of the stack doesn't need.
//!
//! Peer discovery is out of scope — callers register known addresses with
//! [`TcpEndpoint::add_known_peer`] (from `--peer` flags or a config file)
//! before calling `connect`.

use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tracing::{debug, warn};

use meshrelay_protocol::endpoint::{
    Connection, ConnectionCallback, Endpoint, RealmContext, Stream, StreamHandler,
};
use meshrelay_protocol::identity::NodeId;

/// Reserved protocol id for the identify handshake `connect()` performs.
/// Never dispatched to an application-registered handler.
const IDENTIFY_PROTOCOL_ID: &str = "_meshrelay/identify/1.0";

/// Longest protocol id accepted in a stream header. Guards the header
/// parser against a peer sending an unbounded length prefix.
const MAX_PROTOCOL_ID_LEN: u16 = 256;

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

/// A [`Stream`] backed by one TCP socket, with optional read/write deadlines
/// enforced on every poll.
pub struct TcpStreamWrapper {
    inner: TcpStream,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
}

impl TcpStreamWrapper {
    fn new(inner: TcpStream) -> Self {
        Self { inner, read_deadline: None, write_deadline: None }
    }
}

impl AsyncRead for TcpStreamWrapper {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(deadline) = self.read_deadline {
            if Instant::now() >= deadline {
                return Poll::Ready(Err(io::Error::new(ErrorKind::TimedOut, "read deadline elapsed")));
            }
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpStreamWrapper {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if let Some(deadline) = self.write_deadline {
            if Instant::now() >= deadline {
                return Poll::Ready(Err(io::Error::new(ErrorKind::TimedOut, "write deadline elapsed")));
            }
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[async_trait]
impl Stream for TcpStreamWrapper {
    async fn close(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }

    async fn close_write(&mut self) -> io::Result<()> {
        AsyncWriteExt::shutdown(&mut self.inner).await
    }

    fn set_read_deadline(&mut self, deadline: Duration) {
        self.read_deadline = Some(Instant::now() + deadline);
    }

    fn set_write_deadline(&mut self, deadline: Duration) {
        self.write_deadline = Some(Instant::now() + deadline);
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct TcpConnection {
    local_id: NodeId,
    remote_id: NodeId,
    addr: SocketAddr,
}

#[async_trait]
impl Connection for TcpConnection {
    fn remote_id(&self) -> NodeId {
        self.remote_id
    }

    fn realm_context(&self) -> Option<Arc<dyn RealmContext>> {
        // Realm authorization over plain TCP has no transport-level identity
        // to derive a realm context from; hosts that need realm-scoped
        // topics over this transport must layer their own auth handshake
        // and plug a `RealmContext` in here.
        None
    }

    async fn open_stream(&self, protocol_id: &str) -> io::Result<Box<dyn Stream>> {
        let mut tcp = TcpStream::connect(self.addr).await?;
        tcp.set_nodelay(true)?;
        write_header(&mut tcp, &self.local_id, protocol_id).await?;
        Ok(Box::new(TcpStreamWrapper::new(tcp)))
    }
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// A plain-TCP [`Endpoint`]. One listener accepts both identify handshakes
/// and application protocol streams, demultiplexed by the header each
/// inbound socket starts with.
pub struct TcpEndpoint {
    id: NodeId,
    local_addr: SocketAddr,
    addr_book: DashMap<NodeId, SocketAddr>,
    connections: DashMap<NodeId, Arc<TcpConnection>>,
    handlers: DashMap<String, StreamHandler>,
    callbacks: RwLock<Vec<ConnectionCallback>>,
}

impl TcpEndpoint {
    /// Creates the endpoint and starts accepting connections on `listen_addr`.
    pub async fn bind(id: NodeId, listen_addr: SocketAddr) -> io::Result<Arc<Self>> {
        let listener = TcpListener::bind(listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let this = Arc::new(Self {
            id,
            local_addr,
            addr_book: DashMap::new(),
            connections: DashMap::new(),
            handlers: DashMap::new(),
            callbacks: RwLock::new(Vec::new()),
        });
        this.clone().spawn_accept_loop(listener);
        Ok(this)
    }

    /// The address actually bound — useful when `listen_addr` used port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Registers the address a peer can be dialed at. Must be called before
    /// `connect(&id)` or `connection(&id).open_stream(..)` will succeed.
    pub fn add_known_peer(&self, id: NodeId, addr: SocketAddr) {
        self.addr_book.insert(id, addr);
    }

    fn fire_callbacks(&self, peer: NodeId, outbound: bool) {
        for cb in self.callbacks.read().iter() {
            cb(peer, outbound);
        }
    }

    fn spawn_accept_loop(self: Arc<Self>, listener: TcpListener) {
        tokio::spawn(async move {
            loop {
                let (socket, peer_addr) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "tcp accept failed");
                        continue;
                    }
                };
                let this = Arc::clone(&self);
                tokio::spawn(async move {
                    if let Err(e) = this.handle_inbound(socket, peer_addr).await {
                        debug!(peer_addr = %peer_addr, error = %e, "inbound connection failed");
                    }
                });
            }
        });
    }

    async fn handle_inbound(&self, mut socket: TcpStream, peer_addr: SocketAddr) -> io::Result<()> {
        socket.set_nodelay(true)?;
        let (remote_id, protocol_id) = read_header(&mut socket).await?;

        if protocol_id == IDENTIFY_PROTOCOL_ID {
            let mut ack = [0u8; 32];
            ack.copy_from_slice(self.id.as_bytes());
            socket.write_all(&ack).await?;
            socket.shutdown().await?;

            let conn = Arc::new(TcpConnection { local_id: self.id, remote_id, addr: peer_addr });
            self.connections.insert(remote_id, conn);
            self.addr_book.entry(remote_id).or_insert(peer_addr);
            self.fire_callbacks(remote_id, false);
            return Ok(());
        }

        let handler = match self.handlers.get(&protocol_id) {
            Some(h) => h.clone(),
            None => {
                debug!(protocol_id = %protocol_id, "no handler registered, dropping stream");
                return Ok(());
            }
        };
        handler(remote_id, Box::new(TcpStreamWrapper::new(socket)));
        Ok(())
    }
}

#[async_trait]
impl Endpoint for TcpEndpoint {
    fn id(&self) -> NodeId {
        self.id
    }

    fn connections(&self) -> Vec<Arc<dyn Connection>> {
        self.connections
            .iter()
            .map(|e| Arc::clone(e.value()) as Arc<dyn Connection>)
            .collect()
    }

    fn connection(&self, id: &NodeId) -> Option<Arc<dyn Connection>> {
        self.connections.get(id).map(|e| Arc::clone(e.value()) as Arc<dyn Connection>)
    }

    async fn connect(&self, id: &NodeId) -> io::Result<Arc<dyn Connection>> {
        let addr = *self
            .addr_book
            .get(id)
            .ok_or_else(|| io::Error::new(ErrorKind::NotFound, "no known address for peer"))?;

        let mut tcp = TcpStream::connect(addr).await?;
        tcp.set_nodelay(true)?;
        write_header(&mut tcp, &self.id, IDENTIFY_PROTOCOL_ID).await?;

        let mut ack = [0u8; 32];
        tcp.read_exact(&mut ack).await?;
        let remote_id = NodeId::from_bytes(ack);
        if remote_id != *id {
            return Err(io::Error::new(ErrorKind::InvalidData, "peer identity mismatch"));
        }

        let conn = Arc::new(TcpConnection { local_id: self.id, remote_id, addr });
        self.connections.insert(remote_id, Arc::clone(&conn));
        self.fire_callbacks(remote_id, true);
        Ok(conn as Arc<dyn Connection>)
    }

    fn set_protocol_handler(&self, protocol_id: &str, handler: StreamHandler) {
        self.handlers.insert(protocol_id.to_string(), handler);
    }

    fn remove_protocol_handler(&self, protocol_id: &str) {
        self.handlers.remove(protocol_id);
    }

    fn register_connection_callback(&self, callback: ConnectionCallback) {
        self.callbacks.write().push(callback);
    }
}

// ---------------------------------------------------------------------------
// Stream header framing: [32-byte sender NodeId][u16 BE len][protocol id]
// ---------------------------------------------------------------------------

async fn write_header(tcp: &mut TcpStream, sender: &NodeId, protocol_id: &str) -> io::Result<()> {
    let id_bytes = protocol_id.as_bytes();
    if id_bytes.len() > MAX_PROTOCOL_ID_LEN as usize {
        return Err(io::Error::new(ErrorKind::InvalidInput, "protocol id too long"));
    }
    tcp.write_all(sender.as_bytes()).await?;
    tcp.write_all(&(id_bytes.len() as u16).to_be_bytes()).await?;
    tcp.write_all(id_bytes).await?;
    Ok(())
}

async fn read_header(tcp: &mut TcpStream) -> io::Result<(NodeId, String)> {
    let mut id_buf = [0u8; 32];
    tcp.read_exact(&mut id_buf).await?;
    let sender = NodeId::from_bytes(id_buf);

    let mut len_buf = [0u8; 2];
    tcp.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf);
    if len > MAX_PROTOCOL_ID_LEN {
        return Err(io::Error::new(ErrorKind::InvalidData, "protocol id too long"));
    }

    let mut proto_buf = vec![0u8; len as usize];
    tcp.read_exact(&mut proto_buf).await?;
    let protocol_id = String::from_utf8(proto_buf)
        .map_err(|_| io::Error::new(ErrorKind::InvalidData, "protocol id is not utf-8"))?;

    Ok((sender, protocol_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn node_id(byte: u8) -> NodeId {
        NodeId::from_bytes([byte; 32])
    }

    #[tokio::test]
    async fn connect_performs_identify_handshake_both_ways() {
        let a = TcpEndpoint::bind(node_id(1), "127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = TcpEndpoint::bind(node_id(2), "127.0.0.1:0".parse().unwrap()).await.unwrap();

        let b_addr = b.local_addr();
        a.add_known_peer(node_id(2), b_addr);

        let conn = a.connect(&node_id(2)).await.unwrap();
        assert_eq!(conn.remote_id(), node_id(2));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(b.connection(&node_id(1)).is_some());
    }

    #[tokio::test]
    async fn connect_rejects_identity_mismatch() {
        let a = TcpEndpoint::bind(node_id(1), "127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = TcpEndpoint::bind(node_id(2), "127.0.0.1:0".parse().unwrap()).await.unwrap();

        let b_addr = b.local_addr();
        a.add_known_peer(node_id(99), b_addr);

        let result = a.connect(&node_id(99)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn open_stream_dispatches_to_registered_handler() {
        let a = TcpEndpoint::bind(node_id(1), "127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = TcpEndpoint::bind(node_id(2), "127.0.0.1:0".parse().unwrap()).await.unwrap();

        let b_addr = b.local_addr();
        a.add_known_peer(node_id(2), b_addr);

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        b.set_protocol_handler(
            "test/echo/1.0",
            Arc::new(move |_peer, mut stream| {
                let hits = Arc::clone(&hits_clone);
                tokio::spawn(async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    let _ = stream.close().await;
                });
            }),
        );

        let conn = a.connect(&node_id(2)).await.unwrap();
        let mut stream = conn.open_stream("test/echo/1.0").await.unwrap();
        let _ = stream.close_write().await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}

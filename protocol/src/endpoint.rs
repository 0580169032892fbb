//! # Endpoint, Connection, Stream, RealmContext (§6)
//!
//! The transport boundary. This crate defines these as traits and never
//! ships a concrete TCP/QUIC implementation — wiring a real transport is
//! the host process's job. An `InMemoryEndpoint` test double lives under
//! `protocol/tests/support/` for exercising the end-to-end scenarios.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::identity::NodeId;

/// Authorization context attached to a connection for realm-scoped topics
/// (`realm/{id}/...`). `None`/absent realm context means the connection is
/// never authorized for any realm topic.
pub trait RealmContext: Send + Sync + fmt::Debug {
    fn is_valid(&self) -> bool;
    fn realm_id(&self) -> &str;
}

/// One duplexed byte stream opened for a single protocol id. Implementors
/// get `AsyncRead + AsyncWrite` for free via the wire-framing helpers in
/// `wire.rs`; `close`/`close_write` are split out because not every
/// transport exposes TCP-style half-close through the `AsyncWrite` trait
/// alone.
#[async_trait]
pub trait Stream: AsyncRead + AsyncWrite + Send + Sync + Unpin {
    async fn close(&mut self) -> std::io::Result<()>;
    async fn close_write(&mut self) -> std::io::Result<()>;
    fn set_read_deadline(&mut self, deadline: std::time::Duration);
    fn set_write_deadline(&mut self, deadline: std::time::Duration);
}

/// A connection to a remote peer. One `Connection` may have many streams
/// opened on it over its lifetime.
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    fn remote_id(&self) -> NodeId;
    fn realm_context(&self) -> Option<Arc<dyn RealmContext>>;
    async fn open_stream(&self, protocol_id: &str) -> std::io::Result<Box<dyn Stream>>;
}

/// A handler invoked with the remote peer's id and every inbound stream
/// opened for a protocol id a caller registered via
/// [`Endpoint::set_protocol_handler`].
pub type StreamHandler = Arc<dyn Fn(NodeId, Box<dyn Stream>) + Send + Sync>;

/// A callback invoked once per new connection, with the remote id and
/// whether the connection was dialed by us (`outbound = true`) or accepted.
pub type ConnectionCallback = Arc<dyn Fn(NodeId, bool) + Send + Sync>;

/// The connection/stream capability the router, heartbeat, and req/resp and
/// notify services consume. Never implemented by this crate directly —
/// only by the host process's transport and by test doubles.
#[async_trait]
pub trait Endpoint: Send + Sync {
    fn id(&self) -> NodeId;
    fn connections(&self) -> Vec<Arc<dyn Connection>>;
    fn connection(&self, id: &NodeId) -> Option<Arc<dyn Connection>>;
    async fn connect(&self, id: &NodeId) -> std::io::Result<Arc<dyn Connection>>;
    fn set_protocol_handler(&self, protocol_id: &str, handler: StreamHandler);
    fn remove_protocol_handler(&self, protocol_id: &str);
    fn register_connection_callback(&self, callback: ConnectionCallback);
}

//! # Identity Module
//!
//! Peer identity for the mesh relay. Every participant is addressed by an
//! opaque, totally-ordered 32-byte [`NodeId`] — how that id was derived
//! (from a public key, from a stable random seed, from something else
//! entirely) is a concern of the host process, not this crate.

mod node_id;

pub use node_id::NodeId;

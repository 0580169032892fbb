//! # Cryptographic Primitives
//!
//! Signing-envelope construction, hashing, and signature verification for
//! the three key types the wire format recognizes: Ed25519, ECDSA P-256,
//! and ECDSA P-384 (§3). Key *management* — generation, storage, rotation —
//! is left to the host process; this module only wraps the bytes enough to
//! sign and verify safely.

pub mod hash;
pub mod keys;
pub mod signatures;

pub use hash::{sha256, sha256_array, sha384};
pub use keys::{verify_with_key_type, KeyError, KeyType, NodeKeypair};
pub use signatures::{build_envelope, hash_envelope, sign_message, verify_message, SignatureError};

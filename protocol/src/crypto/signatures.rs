//! # Signing Envelope
//!
//! The bytes a signature covers, and the hash-then-verify logic described
//! in §3: `topic_bytes ‖ from_bytes(32) ‖ seq_be64 ‖ data`, hashed with
//! SHA-256 for Ed25519/P-256 or SHA-384 for P-384, then signed/verified on
//! the resulting digest.
//!
//! We don't tell callers *why* verification failed beyond the taxonomy in
//! [`SignatureError`] — giving a detailed oracle to whoever crafted the bad
//! signature is not a courtesy worth extending.

use thiserror::Error;

use super::hash::{sha256, sha384};
use super::keys::{verify_with_key_type, KeyError, KeyType, NodeKeypair};
use crate::identity::NodeId;

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("signature verification failed")]
    VerificationFailed,

    #[error("key error: {0}")]
    Key(#[from] KeyError),
}

/// Build the signing envelope: `topic_bytes ‖ from_bytes(32) ‖ seq_be64 ‖ data`.
pub fn build_envelope(topic: &str, from: &NodeId, seq: u64, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(topic.len() + 32 + 8 + data.len());
    buf.extend_from_slice(topic.as_bytes());
    buf.extend_from_slice(from.as_bytes());
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(data);
    buf
}

/// Hash the envelope with the curve-appropriate hash function.
pub fn hash_envelope(key_type: KeyType, envelope: &[u8]) -> Vec<u8> {
    match key_type {
        KeyType::EcdsaP384 => sha384(envelope),
        // Ed25519, P-256, and the inference-failed Unknown case all use
        // SHA-256; Unknown never reaches a verifier (it's rejected upstream).
        _ => sha256(envelope),
    }
}

/// Sign `(topic, from, seq, data)` with `keypair`, returning the raw
/// signature bytes ready to place on the wire.
pub fn sign_message(keypair: &NodeKeypair, topic: &str, from: &NodeId, seq: u64, data: &[u8]) -> Vec<u8> {
    let envelope = build_envelope(topic, from, seq, data);
    let digest = hash_envelope(keypair.key_type(), &envelope);
    keypair.sign(&digest)
}

/// Verify a signature over the envelope built from the given fields.
pub fn verify_message(
    key_type: KeyType,
    key_bytes: &[u8],
    topic: &str,
    from: &NodeId,
    seq: u64,
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    let envelope = build_envelope(topic, from, seq, data);
    let digest = hash_envelope(key_type, &envelope);
    verify_with_key_type(key_type, key_bytes, &digest, signature)
        .map_err(|_| SignatureError::VerificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_id(n: u8) -> NodeId {
        let mut bytes = [0u8; 32];
        bytes[0] = n;
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn envelope_is_deterministic() {
        let from = node_id(1);
        let a = build_envelope("t", &from, 7, b"hello");
        let b = build_envelope("t", &from, 7, b"hello");
        assert_eq!(a, b);
    }

    #[test]
    fn envelope_changes_with_any_field() {
        let from = node_id(1);
        let base = build_envelope("t", &from, 7, b"hello");
        assert_ne!(base, build_envelope("u", &from, 7, b"hello"));
        assert_ne!(base, build_envelope("t", &node_id(2), 7, b"hello"));
        assert_ne!(base, build_envelope("t", &from, 8, b"hello"));
        assert_ne!(base, build_envelope("t", &from, 7, b"world"));
    }

    #[test]
    fn ed25519_sign_and_verify_roundtrip() {
        let kp = NodeKeypair::generate_ed25519();
        let from = node_id(5);
        let sig = sign_message(&kp, "topic", &from, 1, b"data");
        assert!(verify_message(
            KeyType::Ed25519,
            &kp.public_key_bytes(),
            "topic",
            &from,
            1,
            b"data",
            &sig
        )
        .is_ok());
    }

    #[test]
    fn p384_uses_sha384_and_verifies() {
        let kp = NodeKeypair::generate_ecdsa_p384();
        let from = node_id(9);
        let sig = sign_message(&kp, "topic", &from, 1, b"data");
        assert!(verify_message(
            KeyType::EcdsaP384,
            &kp.public_key_bytes(),
            "topic",
            &from,
            1,
            b"data",
            &sig
        )
        .is_ok());
    }

    #[test]
    fn verification_fails_with_wrong_data() {
        let kp = NodeKeypair::generate_ed25519();
        let from = node_id(5);
        let sig = sign_message(&kp, "topic", &from, 1, b"data");
        assert!(verify_message(
            KeyType::Ed25519,
            &kp.public_key_bytes(),
            "topic",
            &from,
            1,
            b"different",
            &sig
        )
        .is_err());
    }
}

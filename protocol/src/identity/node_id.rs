//! Opaque peer identifier.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An opaque 32-byte peer identifier.
///
/// Totally ordered by byte comparison so it can key sorted collections and
/// drive deterministic tie-breaks. The all-zero value is reserved and never
/// a valid publisher id — `Message::from` of all zeros is rejected.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; 32]);

impl NodeId {
    pub const ZERO: NodeId = NodeId([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn try_from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() != 32 {
            return None;
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(slice);
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Canonical short form used in log lines: first 8 hex characters.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_zero() {
        assert!(NodeId::ZERO.is_zero());
        assert!(!NodeId::from_bytes([1u8; 32]).is_zero());
    }

    #[test]
    fn ordering_is_byte_lexicographic() {
        let a = NodeId::from_bytes([1u8; 32]);
        let mut b_bytes = [1u8; 32];
        b_bytes[31] = 2;
        let b = NodeId::from_bytes(b_bytes);
        assert!(a < b);
    }

    #[test]
    fn short_is_stable_prefix_of_hex() {
        let id = NodeId::from_bytes([0xAB; 32]);
        assert_eq!(id.short(), "abababab");
        assert!(id.to_hex().starts_with(&id.short()));
    }

    #[test]
    fn try_from_slice_rejects_wrong_length() {
        assert!(NodeId::try_from_slice(&[0u8; 31]).is_none());
        assert!(NodeId::try_from_slice(&[0u8; 32]).is_some());
    }
}

//! # Hashing Utilities
//!
//! The signing envelope (§3: `topic_bytes ‖ from_bytes(32) ‖ seq_be64 ‖ data`)
//! is hashed before verification — SHA-256 for Ed25519 and ECDSA P-256,
//! SHA-384 for ECDSA P-384. These are the only two hash functions this
//! crate needs; we don't reach for anything fancier.

use sha2::{Digest, Sha256, Sha384};

/// Compute the SHA-256 hash of the input data.
pub fn sha256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Compute the SHA-256 hash and return a fixed-size array.
pub fn sha256_array(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut output = [0u8; 32];
    output.copy_from_slice(&result);
    output
}

/// Compute the SHA-384 hash of the input data.
pub fn sha384(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha384::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        let hash = sha256(b"");
        let expected =
            hex::decode("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
                .unwrap();
        assert_eq!(hash, expected);
    }

    #[test]
    fn sha256_deterministic() {
        let a = sha256(b"mesh");
        let b = sha256(b"mesh");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_sha256_array_matches_vec() {
        let vec_result = sha256(b"test data");
        let arr_result = sha256_array(b"test data");
        assert_eq!(vec_result.as_slice(), arr_result.as_slice());
    }

    #[test]
    fn sha384_deterministic_and_48_bytes() {
        let a = sha384(b"mesh");
        let b = sha384(b"mesh");
        assert_eq!(a, b);
        assert_eq!(a.len(), 48);
    }

    #[test]
    fn sha256_and_sha384_differ() {
        assert_ne!(sha256(b"mesh").as_slice(), &sha384(b"mesh")[..32]);
    }
}

//! # Key Types
//!
//! Key material for the signing envelope (§3). A mesh relay node doesn't
//! mandate one curve — it accepts Ed25519, ECDSA P-256, or ECDSA P-384 keys
//! on messages and infers the curve from the key's encoded length when the
//! sender didn't say which curve it used.
//!
//! Key *management* (generation, storage, rotation) is the host process's
//! concern; this module only wraps the bytes enough to sign and verify
//! safely.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use p256::ecdsa::{
    Signature as P256Signature, SigningKey as P256SigningKey, VerifyingKey as P256VerifyingKey,
};
use p384::ecdsa::{
    Signature as P384Signature, SigningKey as P384SigningKey, VerifyingKey as P384VerifyingKey,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Which curve a key/signature pair is on.
///
/// Inferred from encoded key length when a message arrives without an
/// explicit tag: 32 bytes → Ed25519, 65 bytes (uncompressed SEC1) → P-256,
/// 97 bytes (uncompressed SEC1) → P-384.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    Ed25519,
    EcdsaP256,
    EcdsaP384,
    Unknown,
}

impl KeyType {
    /// Infer a key type from the length of an encoded public key, per §4.5.
    pub fn infer_from_key_len(len: usize) -> KeyType {
        match len {
            32 => KeyType::Ed25519,
            65 => KeyType::EcdsaP256,
            97 => KeyType::EcdsaP384,
            _ => KeyType::Unknown,
        }
    }
}

/// Errors during key parsing or signing operations.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid secret key bytes")]
    InvalidSecretKey,

    #[error("invalid public key bytes")]
    InvalidPublicKey,

    #[error("unsupported or unrecognized key type")]
    UnsupportedKeyType,
}

/// A signing keypair on one of the three supported curves.
///
/// Not `Serialize`/`Deserialize` on purpose — serializing private key
/// material should never happen implicitly.
pub enum NodeKeypair {
    Ed25519(SigningKey),
    EcdsaP256(P256SigningKey),
    EcdsaP384(P384SigningKey),
}

impl NodeKeypair {
    pub fn generate_ed25519() -> Self {
        NodeKeypair::Ed25519(SigningKey::generate(&mut OsRng))
    }

    pub fn generate_ecdsa_p256() -> Self {
        NodeKeypair::EcdsaP256(P256SigningKey::random(&mut OsRng))
    }

    pub fn generate_ecdsa_p384() -> Self {
        NodeKeypair::EcdsaP384(P384SigningKey::random(&mut OsRng))
    }

    pub fn key_type(&self) -> KeyType {
        match self {
            NodeKeypair::Ed25519(_) => KeyType::Ed25519,
            NodeKeypair::EcdsaP256(_) => KeyType::EcdsaP256,
            NodeKeypair::EcdsaP384(_) => KeyType::EcdsaP384,
        }
    }

    /// The public key in the encoding the wire format expects: 32 raw bytes
    /// for Ed25519, uncompressed SEC1 points for the ECDSA curves.
    pub fn public_key_bytes(&self) -> Vec<u8> {
        match self {
            NodeKeypair::Ed25519(sk) => sk.verifying_key().to_bytes().to_vec(),
            NodeKeypair::EcdsaP256(sk) => {
                P256VerifyingKey::from(sk).to_encoded_point(false).as_bytes().to_vec()
            }
            NodeKeypair::EcdsaP384(sk) => {
                P384VerifyingKey::from(sk).to_encoded_point(false).as_bytes().to_vec()
            }
        }
    }

    /// The raw secret scalar, for host-process persistence. 32 bytes for
    /// Ed25519 and P-256, 48 for P-384.
    pub fn secret_key_bytes(&self) -> Vec<u8> {
        match self {
            NodeKeypair::Ed25519(sk) => sk.to_bytes().to_vec(),
            NodeKeypair::EcdsaP256(sk) => sk.to_bytes().to_vec(),
            NodeKeypair::EcdsaP384(sk) => sk.to_bytes().to_vec(),
        }
    }

    /// Reconstructs an Ed25519 keypair from a 32-byte secret scalar, as
    /// saved by `secret_key_bytes`.
    pub fn from_ed25519_secret_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(NodeKeypair::Ed25519(SigningKey::from_bytes(&arr)))
    }

    /// Sign raw bytes (the caller is responsible for constructing the
    /// signing envelope before calling this).
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        match self {
            NodeKeypair::Ed25519(sk) => sk.sign(message).to_bytes().to_vec(),
            NodeKeypair::EcdsaP256(sk) => {
                use p256::ecdsa::signature::Signer as _;
                let sig: P256Signature = sk.sign(message);
                sig.to_der().as_bytes().to_vec()
            }
            NodeKeypair::EcdsaP384(sk) => {
                use p384::ecdsa::signature::Signer as _;
                let sig: P384Signature = sk.sign(message);
                sig.to_der().as_bytes().to_vec()
            }
        }
    }
}

impl fmt::Debug for NodeKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeKeypair({:?}, pub={})", self.key_type(), hex::encode(self.public_key_bytes()))
    }
}

/// Verify `signature` over `message` using `key_bytes`, whose curve is
/// given by `key_type`. Returns `Ok(())` on a valid signature.
///
/// `message` here is already the hashed envelope (SHA-256 or SHA-384 per
/// §3) — this function does not hash internally, since the choice of hash
/// depends on the curve and callers in `crypto::signatures` own that logic.
pub fn verify_with_key_type(
    key_type: KeyType,
    key_bytes: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), KeyError> {
    match key_type {
        KeyType::Ed25519 => {
            let arr: [u8; 32] = key_bytes.try_into().map_err(|_| KeyError::InvalidPublicKey)?;
            let vk = VerifyingKey::from_bytes(&arr).map_err(|_| KeyError::InvalidPublicKey)?;
            let sig_arr: [u8; 64] =
                signature.try_into().map_err(|_| KeyError::InvalidSecretKey)?;
            let sig = ed25519_dalek::Signature::from_bytes(&sig_arr);
            vk.verify(message, &sig).map_err(|_| KeyError::InvalidSecretKey)
        }
        KeyType::EcdsaP256 => {
            use p256::ecdsa::signature::Verifier as _;
            let vk = P256VerifyingKey::from_sec1_bytes(key_bytes)
                .map_err(|_| KeyError::InvalidPublicKey)?;
            let sig =
                P256Signature::from_der(signature).map_err(|_| KeyError::InvalidSecretKey)?;
            vk.verify(message, &sig).map_err(|_| KeyError::InvalidSecretKey)
        }
        KeyType::EcdsaP384 => {
            use p384::ecdsa::signature::Verifier as _;
            let vk = P384VerifyingKey::from_sec1_bytes(key_bytes)
                .map_err(|_| KeyError::InvalidPublicKey)?;
            let sig =
                P384Signature::from_der(signature).map_err(|_| KeyError::InvalidSecretKey)?;
            vk.verify(message, &sig).map_err(|_| KeyError::InvalidSecretKey)
        }
        KeyType::Unknown => Err(KeyError::UnsupportedKeyType),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infer_from_key_len() {
        assert_eq!(KeyType::infer_from_key_len(32), KeyType::Ed25519);
        assert_eq!(KeyType::infer_from_key_len(65), KeyType::EcdsaP256);
        assert_eq!(KeyType::infer_from_key_len(97), KeyType::EcdsaP384);
        assert_eq!(KeyType::infer_from_key_len(12), KeyType::Unknown);
    }

    #[test]
    fn ed25519_sign_verify_roundtrip() {
        let kp = NodeKeypair::generate_ed25519();
        let msg = b"envelope bytes";
        let sig = kp.sign(msg);
        assert!(verify_with_key_type(KeyType::Ed25519, &kp.public_key_bytes(), msg, &sig).is_ok());
    }

    #[test]
    fn p256_sign_verify_roundtrip() {
        let kp = NodeKeypair::generate_ecdsa_p256();
        let msg = b"envelope bytes";
        let sig = kp.sign(msg);
        assert_eq!(kp.public_key_bytes().len(), 65);
        assert!(
            verify_with_key_type(KeyType::EcdsaP256, &kp.public_key_bytes(), msg, &sig).is_ok()
        );
    }

    #[test]
    fn p384_sign_verify_roundtrip() {
        let kp = NodeKeypair::generate_ecdsa_p384();
        let msg = b"envelope bytes";
        let sig = kp.sign(msg);
        assert_eq!(kp.public_key_bytes().len(), 97);
        assert!(
            verify_with_key_type(KeyType::EcdsaP384, &kp.public_key_bytes(), msg, &sig).is_ok()
        );
    }

    #[test]
    fn ed25519_secret_bytes_roundtrip() {
        let kp = NodeKeypair::generate_ed25519();
        let restored = NodeKeypair::from_ed25519_secret_bytes(&kp.secret_key_bytes()).unwrap();
        assert_eq!(kp.public_key_bytes(), restored.public_key_bytes());
    }

    #[test]
    fn wrong_message_fails() {
        let kp = NodeKeypair::generate_ed25519();
        let sig = kp.sign(b"correct");
        assert!(verify_with_key_type(KeyType::Ed25519, &kp.public_key_bytes(), b"wrong", &sig)
            .is_err());
    }

    #[test]
    fn unknown_key_type_rejected() {
        let kp = NodeKeypair::generate_ed25519();
        let sig = kp.sign(b"msg");
        assert!(verify_with_key_type(KeyType::Unknown, &kp.public_key_bytes(), b"msg", &sig)
            .is_err());
    }
}

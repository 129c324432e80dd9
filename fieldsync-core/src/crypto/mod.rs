//! Ed25519 signing primitives and key transport encoding.
//!
//! Every record and handshake signature in fieldsync is a detached
//! Ed25519 signature over a canonical string, transported as base64.
//! Public keys travel as colon-joined base64 parameter blocks so the
//! encoding survives key schemes with more than one parameter.

pub mod keystore;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroize;

/// Cryptography errors.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Invalid public key encoding: {0}")]
    InvalidKey(String),

    #[error("Invalid signing key material")]
    InvalidSigningKey,
}

/// A device's Ed25519 keypair.
#[derive(Clone)]
pub struct DeviceKeys {
    signing_key: SigningKey,
}

impl DeviceKeys {
    /// Generate a fresh keypair.
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        let signing_key = SigningKey::from_bytes(&secret);
        secret.zeroize();
        Self { signing_key }
    }

    /// Reconstruct a keypair from stored seed bytes.
    pub fn from_seed(seed: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; 32] = seed.try_into().map_err(|_| CryptoError::InvalidSigningKey)?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&bytes),
        })
    }

    /// The raw 32-byte seed, for keystore persistence.
    pub fn seed_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// The public (verifying) half of the keypair.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign a message, returning the signature as base64.
    pub fn sign_base64(&self, message: &[u8]) -> String {
        let signature = self.signing_key.sign(message);
        STANDARD.encode(signature.to_bytes())
    }
}

/// Encode a public key as colon-joined base64 parameter blocks.
///
/// Ed25519 keys have a single 32-byte parameter, so the encoded form is a
/// single block; the joining contract is kept so the transport format
/// does not change with the key scheme.
pub fn encode_public_key(key: &VerifyingKey) -> String {
    let parts = [key.to_bytes()];
    parts
        .iter()
        .map(|p| STANDARD.encode(p))
        .collect::<Vec<_>>()
        .join(":")
}

/// Decode a public key from its colon-joined transport string.
pub fn decode_public_key(encoded: &str) -> Result<VerifyingKey, CryptoError> {
    let parts: Vec<&str> = encoded.split(':').collect();
    if parts.len() != 1 {
        return Err(CryptoError::InvalidKey(format!(
            "expected 1 parameter block, got {}",
            parts.len()
        )));
    }
    let bytes = STANDARD
        .decode(parts[0])
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let arr: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("bad key length: {}", bytes.len())))?;
    VerifyingKey::from_bytes(&arr).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// Verify a base64 signature over a message.
///
/// Fails closed: any decoding problem in the signature is treated as a
/// verification failure rather than an error.
pub fn verify_base64(key: &VerifyingKey, message: &[u8], signature_b64: &str) -> bool {
    let Ok(sig_bytes) = STANDARD.decode(signature_b64.trim()) else {
        return false;
    };
    let Ok(arr) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
        return false;
    };
    let signature = Signature::from_bytes(&arr);
    key.verify(message, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let keys = DeviceKeys::generate();
        let sig = keys.sign_base64(b"canonical representation");
        assert!(verify_base64(
            &keys.verifying_key(),
            b"canonical representation",
            &sig
        ));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let keys = DeviceKeys::generate();
        let other = DeviceKeys::generate();
        let sig = keys.sign_base64(b"message");
        assert!(!verify_base64(&other.verifying_key(), b"message", &sig));
    }

    #[test]
    fn tampered_message_fails_verification() {
        let keys = DeviceKeys::generate();
        let sig = keys.sign_base64(b"message");
        assert!(!verify_base64(&keys.verifying_key(), b"messag3", &sig));
    }

    #[test]
    fn garbage_signature_fails_closed() {
        let keys = DeviceKeys::generate();
        assert!(!verify_base64(&keys.verifying_key(), b"m", "not base64!!"));
        assert!(!verify_base64(&keys.verifying_key(), b"m", "AAAA"));
    }

    #[test]
    fn public_key_encoding_roundtrip() {
        let keys = DeviceKeys::generate();
        let encoded = encode_public_key(&keys.verifying_key());
        let decoded = decode_public_key(&encoded).unwrap();
        assert_eq!(decoded.to_bytes(), keys.verifying_key().to_bytes());
    }

    #[test]
    fn encoded_key_is_single_block() {
        let keys = DeviceKeys::generate();
        let encoded = encode_public_key(&keys.verifying_key());
        assert!(!encoded.contains(':'));
    }

    #[test]
    fn malformed_key_encoding_rejected() {
        assert!(decode_public_key("a:b:c").is_err());
        assert!(decode_public_key("!!!not-base64!!!").is_err());
        assert!(decode_public_key("AAAA").is_err());
    }

    #[test]
    fn seed_roundtrip_preserves_identity() {
        let keys = DeviceKeys::generate();
        let restored = DeviceKeys::from_seed(&keys.seed_bytes()).unwrap();
        assert_eq!(
            restored.verifying_key().to_bytes(),
            keys.verifying_key().to_bytes()
        );
    }

    #[test]
    fn bad_seed_length_rejected() {
        assert!(DeviceKeys::from_seed(&[0u8; 16]).is_err());
    }
}

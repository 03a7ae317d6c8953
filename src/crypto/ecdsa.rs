//! ECDSA over secp256k1
//!
//! Keys are compressed SEC1 points, signatures are DER encoded and always
//! produced over a 32-byte digest (no further hashing inside the signer).
//! Consensus code only touches the free functions at the bottom of this
//! file, so the backing library can be swapped without touching validation.

use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{hash160, Hash, PubKeyHash};

/// Length of a compressed SEC1 public key
pub const PUBKEY_LEN: usize = 33;

/// Signature errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid DER signature encoding")]
    InvalidEncoding,
    #[error("Signature does not verify")]
    InvalidSignature,
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Signing failed: {0}")]
    SigningFailed(String),
}

/// secp256k1 private key
#[derive(Clone)]
pub struct PrivateKey(SigningKey);

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrivateKey([REDACTED])")
    }
}

/// 33-byte compressed public key. All zeros stands for "no key" (coinbase).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "pubkey_serde")] pub [u8; PUBKEY_LEN]);

mod pubkey_serde {
    use super::PUBKEY_LEN;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; PUBKEY_LEN], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; PUBKEY_LEN], D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("Invalid public key length"))
    }
}

impl PrivateKey {
    /// Generate a new random private key
    pub fn generate() -> Self {
        PrivateKey(SigningKey::random(&mut OsRng))
    }

    /// Create from 32 bytes
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, SignatureError> {
        SigningKey::from_slice(bytes)
            .map(PrivateKey)
            .map_err(|_| SignatureError::InvalidPrivateKey)
    }

    /// Get the corresponding compressed public key
    pub fn public_key(&self) -> PublicKey {
        let point = self.0.verifying_key().to_encoded_point(true);
        let mut bytes = [0u8; PUBKEY_LEN];
        bytes.copy_from_slice(point.as_bytes());
        PublicKey(bytes)
    }

    /// Export to bytes
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes().into()
    }
}

impl PublicKey {
    /// The placeholder key carried by coinbase inputs
    pub const fn empty() -> Self {
        PublicKey([0u8; PUBKEY_LEN])
    }

    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; PUBKEY_LEN]
    }

    /// Create from 33 bytes, checking that they encode a curve point
    pub fn from_bytes(bytes: &[u8; PUBKEY_LEN]) -> Result<Self, SignatureError> {
        parse_public_key(bytes)?;
        Ok(PublicKey(*bytes))
    }

    /// `ripemd160(sha256(pubkey))`
    pub fn pubkey_hash(&self) -> PubKeyHash {
        hash160(&self.0)
    }

    /// Export to bytes
    pub fn to_bytes(&self) -> [u8; PUBKEY_LEN] {
        self.0
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.0))
    }
}

/// Sign a 32-byte digest, returning the DER encoded signature
pub fn sign_digest(key: &PrivateKey, digest: &Hash) -> Result<Vec<u8>, SignatureError> {
    let signature: Signature = key
        .0
        .sign_prehash(&digest.0)
        .map_err(|e| SignatureError::SigningFailed(e.to_string()))?;
    Ok(signature.to_der().as_bytes().to_vec())
}

/// Parse a compressed SEC1 public key
pub fn parse_public_key(bytes: &[u8; PUBKEY_LEN]) -> Result<VerifyingKey, SignatureError> {
    VerifyingKey::from_sec1_bytes(bytes).map_err(|_| SignatureError::InvalidPublicKey)
}

/// Parse a DER encoded signature
pub fn parse_der_signature(der: &[u8]) -> Result<Signature, SignatureError> {
    Signature::from_der(der).map_err(|_| SignatureError::InvalidEncoding)
}

/// Verify a DER signature over `digest` with `public_key`
pub fn verify_digest(
    public_key: &PublicKey,
    digest: &Hash,
    der: &[u8],
) -> Result<(), SignatureError> {
    let verifying_key = parse_public_key(&public_key.0)?;
    let signature = parse_der_signature(der)?;
    verifying_key
        .verify_prehash(&digest.0, &signature)
        .map_err(|_| SignatureError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::double_sha256;

    #[test]
    fn test_public_key_is_compressed() {
        let public = PrivateKey::generate().public_key();
        assert!(public.0[0] == 0x02 || public.0[0] == 0x03);
        assert!(PublicKey::from_bytes(&public.0).is_ok());
    }

    #[test]
    fn test_sign_verify() {
        let private = PrivateKey::generate();
        let public = private.public_key();
        let digest = double_sha256(b"test message");

        let der = sign_digest(&private, &digest).unwrap();
        assert_eq!(der[0], 0x30);
        assert!(verify_digest(&public, &digest, &der).is_ok());
    }

    #[test]
    fn test_wrong_key_fails() {
        let signer = PrivateKey::generate();
        let other = PrivateKey::generate().public_key();
        let digest = double_sha256(b"test message");
        let der = sign_digest(&signer, &digest).unwrap();

        assert_eq!(
            verify_digest(&other, &digest, &der),
            Err(SignatureError::InvalidSignature)
        );
    }

    #[test]
    fn test_wrong_message_fails() {
        let private = PrivateKey::generate();
        let der = sign_digest(&private, &double_sha256(b"message 1")).unwrap();

        assert_eq!(
            verify_digest(&private.public_key(), &double_sha256(b"message 2"), &der),
            Err(SignatureError::InvalidSignature)
        );
    }

    #[test]
    fn test_garbage_encodings_are_distinguished() {
        let digest = double_sha256(b"x");
        assert_eq!(
            verify_digest(&PublicKey::empty(), &digest, &[0x30]),
            Err(SignatureError::InvalidPublicKey)
        );

        let public = PrivateKey::generate().public_key();
        assert_eq!(
            verify_digest(&public, &digest, &[0xde, 0xad]),
            Err(SignatureError::InvalidEncoding)
        );
    }

    #[test]
    fn test_key_serialization() {
        let private = PrivateKey::generate();
        let recovered = PrivateKey::from_bytes(&private.to_bytes()).unwrap();
        assert_eq!(private.public_key(), recovered.public_key());
    }
}

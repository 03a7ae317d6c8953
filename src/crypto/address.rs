//! Base58Check codec
//!
//! `base58(version ‖ payload ‖ checksum)` where the checksum is the first
//! four bytes of the double-SHA256 of `version ‖ payload`.

use thiserror::Error;

use super::{double_sha256, PubKeyHash};

/// Version byte for pay-to-pubkey-hash addresses
pub const ADDRESS_VERSION: u8 = 0x00;

const CHECKSUM_LEN: usize = 4;

/// Address decoding errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid base58 string")]
    InvalidBase58,
    #[error("Decoded data too short")]
    TooShort,
    #[error("Checksum mismatch")]
    BadChecksum,
    #[error("Expected {expected} payload bytes, got {got}")]
    WrongPayloadLength { expected: usize, got: usize },
}

/// Encode `payload` with a leading version byte and checksum
pub fn bytes_to_base58_check(payload: &[u8], version: u8) -> String {
    let mut data = Vec::with_capacity(1 + payload.len() + CHECKSUM_LEN);
    data.push(version);
    data.extend_from_slice(payload);
    let checksum = double_sha256(&data);
    data.extend_from_slice(&checksum.0[..CHECKSUM_LEN]);
    bs58::encode(data).into_string()
}

/// Decode a Base58Check string into `(payload, version)`
pub fn base58_check_to_bytes(encoded: &str) -> Result<(Vec<u8>, u8), AddressError> {
    let data = bs58::decode(encoded)
        .into_vec()
        .map_err(|_| AddressError::InvalidBase58)?;

    if data.len() < 1 + CHECKSUM_LEN {
        return Err(AddressError::TooShort);
    }

    let (body, checksum) = data.split_at(data.len() - CHECKSUM_LEN);
    if double_sha256(body).0[..CHECKSUM_LEN] != *checksum {
        return Err(AddressError::BadChecksum);
    }

    Ok((body[1..].to_vec(), body[0]))
}

/// Encode a public key hash as an address
pub fn pubkey_hash_to_address(pkh: &PubKeyHash) -> String {
    bytes_to_base58_check(&pkh.0, ADDRESS_VERSION)
}

/// Decode an address back to its public key hash
pub fn address_to_pubkey_hash(address: &str) -> Result<PubKeyHash, AddressError> {
    let (payload, _version) = base58_check_to_bytes(address)?;
    PubKeyHash::from_slice(&payload).ok_or(AddressError::WrongPayloadLength {
        expected: 20,
        got: payload.len(),
    })
}

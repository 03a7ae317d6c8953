//! Cryptography module - SHA-256 hashing, secp256k1 ECDSA, Merkle trees, Base58Check

mod address;
mod ecdsa;
mod hash;
mod merkle;

pub use address::*;
pub use ecdsa::*;
pub use hash::*;
pub use merkle::*;

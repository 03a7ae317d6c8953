//! Transaction structure
//!
//! Pay-to-pubkey-hash transactions with DER ECDSA signatures. The canonical
//! serialization is little-endian throughout; outpoint keys are big-endian
//! so that they sort lexicographically in the KV store.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::constants::{COINBASE_OUTPUT_INDEX, COINBASE_SIGNATURE_LEN};
use crate::crypto::{double_sha256, sign_digest, Hash, PrivateKey, PubKeyHash, PublicKey, SignatureError};

/// Transaction identity: double-SHA256 of the canonical serialization
pub type TransactionId = Hash;

/// Length of an outpoint key: txid followed by the big-endian index
pub const OUTPOINT_KEY_LEN: usize = 36;

/// Reference to a specific transaction output
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Outpoint {
    pub txid: TransactionId,
    pub index: u32,
}

impl Outpoint {
    pub fn new(txid: TransactionId, index: u32) -> Self {
        Self { txid, index }
    }

    /// `txid ‖ BE(index)`
    pub fn to_key(&self) -> [u8; OUTPOINT_KEY_LEN] {
        let mut key = [0u8; OUTPOINT_KEY_LEN];
        key[..32].copy_from_slice(&self.txid.0);
        key[32..].copy_from_slice(&self.index.to_be_bytes());
        key
    }

    pub fn from_key(key: &[u8]) -> Option<Self> {
        if key.len() != OUTPOINT_KEY_LEN {
            return None;
        }
        let txid: [u8; 32] = key[..32].try_into().ok()?;
        let index: [u8; 4] = key[32..].try_into().ok()?;
        Some(Self {
            txid: Hash(txid),
            index: u32::from_be_bytes(index),
        })
    }
}

impl fmt::Debug for Outpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

impl fmt::Display for Outpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// A transaction input referencing a previous output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// Id of the transaction containing the output
    pub prev_tx_id: TransactionId,
    /// Index of the output in that transaction
    pub output_index: u32,
    /// DER signature (arbitrary height + entropy bytes for coinbase)
    pub signature: Vec<u8>,
    /// Compressed public key of the signer
    pub public_key: PublicKey,
}

impl TxInput {
    /// Unsigned input spending `outpoint`
    pub fn new(outpoint: Outpoint) -> Self {
        Self {
            prev_tx_id: outpoint.txid,
            output_index: outpoint.index,
            signature: Vec::new(),
            public_key: PublicKey::empty(),
        }
    }

    pub fn outpoint(&self) -> Outpoint {
        Outpoint::new(self.prev_tx_id, self.output_index)
    }
}

/// A transaction output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// Amount in base units
    pub value: u64,
    /// Hash of the recipient public key
    pub pubkey_hash: PubKeyHash,
}

impl TxOutput {
    pub fn new(value: u64, pubkey_hash: PubKeyHash) -> Self {
        Self { value, pubkey_hash }
    }
}

/// A complete transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    /// Create a new transaction
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        Self { inputs, outputs }
    }

    /// Create a coinbase transaction paying `reward` to `miner_pubkey_hash`
    ///
    /// The input "signature" is the 8-byte little-endian height followed by
    /// random entropy, 100 bytes in total.
    pub fn coinbase(height: u64, reward: u64, miner_pubkey_hash: PubKeyHash) -> Self {
        let mut entropy = [0u8; COINBASE_SIGNATURE_LEN - 8];
        rand::thread_rng().fill_bytes(&mut entropy);
        Self::coinbase_with_data(height, reward, miner_pubkey_hash, &entropy)
    }

    /// Coinbase with caller-supplied trailing bytes (deterministic)
    pub fn coinbase_with_data(
        height: u64,
        reward: u64,
        miner_pubkey_hash: PubKeyHash,
        data: &[u8],
    ) -> Self {
        let mut signature = Vec::with_capacity(8 + data.len());
        signature.extend_from_slice(&height.to_le_bytes());
        signature.extend_from_slice(data);

        Self {
            inputs: vec![TxInput {
                prev_tx_id: Hash::zero(),
                output_index: COINBASE_OUTPUT_INDEX,
                signature,
                public_key: PublicKey::empty(),
            }],
            outputs: vec![TxOutput::new(reward, miner_pubkey_hash)],
        }
    }

    /// Check if this is a coinbase transaction
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1
            && self.inputs[0].prev_tx_id.is_zero()
            && self.inputs[0].output_index == COINBASE_OUTPUT_INDEX
    }

    /// Height encoded in the first 8 bytes of a coinbase input
    pub fn coinbase_height(&self) -> Option<u64> {
        if !self.is_coinbase() {
            return None;
        }
        let bytes: [u8; 8] = self.inputs[0].signature.get(..8)?.try_into().ok()?;
        Some(u64::from_le_bytes(bytes))
    }

    /// Canonical serialization
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();

        bytes.extend_from_slice(&(self.inputs.len() as u32).to_le_bytes());
        for input in &self.inputs {
            bytes.extend_from_slice(&input.prev_tx_id.0);
            bytes.extend_from_slice(&input.output_index.to_le_bytes());
            bytes.extend_from_slice(&(input.signature.len() as u32).to_le_bytes());
            bytes.extend_from_slice(&input.signature);
            bytes.extend_from_slice(&input.public_key.0);
        }

        write_outputs(&mut bytes, &self.outputs);
        bytes
    }

    /// Transaction id
    pub fn hash(&self) -> TransactionId {
        double_sha256(&self.to_bytes())
    }

    /// SIGHASH_ALL digest for input `input_index` spending `referenced`
    ///
    /// Signatures and public keys are not committed to; the spent output's
    /// pubkey hash and value take the place of the signed input.
    pub fn signature_hash(&self, input_index: usize, referenced: &TxOutput) -> Hash {
        let mut bytes = Vec::new();

        bytes.extend_from_slice(&(self.inputs.len() as u32).to_le_bytes());
        for (j, input) in self.inputs.iter().enumerate() {
            bytes.extend_from_slice(&input.prev_tx_id.0);
            bytes.extend_from_slice(&input.output_index.to_le_bytes());
            if j == input_index {
                bytes.extend_from_slice(&referenced.pubkey_hash.0);
                bytes.extend_from_slice(&referenced.value.to_le_bytes());
            } else {
                bytes.extend_from_slice(&0u64.to_le_bytes());
            }
        }

        write_outputs(&mut bytes, &self.outputs);
        double_sha256(&bytes)
    }

    /// Sign input `input_index`, which spends `referenced`, with `key`
    pub fn sign_input(
        &mut self,
        input_index: usize,
        key: &PrivateKey,
        referenced: &TxOutput,
    ) -> Result<(), SignatureError> {
        let digest = self.signature_hash(input_index, referenced);
        let signature = sign_digest(key, &digest)?;
        if let Some(input) = self.inputs.get_mut(input_index) {
            input.signature = signature;
            input.public_key = key.public_key();
        }
        Ok(())
    }

    /// Sum of output values, `None` on overflow
    pub fn total_output_value(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, output| acc.checked_add(output.value))
    }
}

fn write_outputs(bytes: &mut Vec<u8>, outputs: &[TxOutput]) {
    bytes.extend_from_slice(&(outputs.len() as u32).to_le_bytes());
    for output in outputs {
        bytes.extend_from_slice(&output.value.to_le_bytes());
        bytes.extend_from_slice(&output.pubkey_hash.0);
    }
}

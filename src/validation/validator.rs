//! Transaction validation against a UTXO provider

use std::collections::HashSet;

use thiserror::Error;

use super::{Outpoint, Transaction};
use crate::crypto::{parse_der_signature, parse_public_key, verify_digest, SignatureError};
use crate::storage::{UtxoError, UtxoProvider};

/// Reasons a transaction is rejected
#[derive(Debug, Error)]
pub enum TxRejection {
    #[error("Transaction has no inputs")]
    NoInputs,
    #[error("Transaction has no outputs")]
    NoOutputs,
    #[error("Input {0} is spent twice")]
    DuplicateInput(Outpoint),
    #[error("Referenced UTXO not found: {0}")]
    UtxoNotFound(Outpoint),
    #[error("Public key does not hash to the spent output's pubkey hash (input {0})")]
    PubKeyHashMismatch(usize),
    #[error("Invalid public key (input {0})")]
    InvalidPubKey(usize),
    #[error("Invalid signature encoding (input {0})")]
    InvalidSignatureEncoding(usize),
    #[error("Signature verification failed (input {0})")]
    SignatureInvalid(usize),
    #[error("Inputs ({inputs}) are less than outputs ({outputs})")]
    InsufficientInputs { inputs: u64, outputs: u64 },
    #[error("Value overflow")]
    ValueOverflow,
    #[error("Fee {fee} is below the minimum {min}")]
    FeeTooLow { fee: u64, min: u64 },
    #[error("UTXO lookup failed: {0}")]
    Utxo(#[from] UtxoError),
}

/// Stateless transaction validator
///
/// The provider decides which chain tip the transaction is checked against.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionValidator;

impl TransactionValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate `tx`, returning its fee
    ///
    /// Coinbase transactions are accepted with a zero fee here; their rules
    /// are enforced at the block level.
    pub fn validate(
        &self,
        tx: &Transaction,
        provider: &dyn UtxoProvider,
    ) -> Result<u64, TxRejection> {
        if tx.is_coinbase() {
            return Ok(0);
        }

        if tx.inputs.is_empty() {
            return Err(TxRejection::NoInputs);
        }
        if tx.outputs.is_empty() {
            return Err(TxRejection::NoOutputs);
        }

        let mut seen = HashSet::with_capacity(tx.inputs.len());
        for input in &tx.inputs {
            let outpoint = input.outpoint();
            if !seen.insert(outpoint) {
                return Err(TxRejection::DuplicateInput(outpoint));
            }
        }

        let mut referenced = Vec::with_capacity(tx.inputs.len());
        for input in &tx.inputs {
            let outpoint = input.outpoint();
            match provider.get(&outpoint) {
                Ok(entry) => referenced.push(entry),
                Err(UtxoError::NotFound(_)) | Err(UtxoError::AlreadySpent(_)) => {
                    return Err(TxRejection::UtxoNotFound(outpoint))
                }
                Err(e) => return Err(e.into()),
            }
        }

        for (i, (input, entry)) in tx.inputs.iter().zip(&referenced).enumerate() {
            if input.public_key.pubkey_hash() != entry.output.pubkey_hash {
                return Err(TxRejection::PubKeyHashMismatch(i));
            }
        }

        for (i, (input, entry)) in tx.inputs.iter().zip(&referenced).enumerate() {
            parse_public_key(&input.public_key.0).map_err(|_| TxRejection::InvalidPubKey(i))?;
            parse_der_signature(&input.signature)
                .map_err(|_| TxRejection::InvalidSignatureEncoding(i))?;

            let digest = tx.signature_hash(i, &entry.output);
            verify_digest(&input.public_key, &digest, &input.signature).map_err(|e| match e {
                SignatureError::InvalidPublicKey => TxRejection::InvalidPubKey(i),
                SignatureError::InvalidEncoding => TxRejection::InvalidSignatureEncoding(i),
                _ => TxRejection::SignatureInvalid(i),
            })?;
        }

        let inputs = referenced
            .iter()
            .try_fold(0u64, |acc, entry| acc.checked_add(entry.value()))
            .ok_or(TxRejection::ValueOverflow)?;
        let outputs = tx.total_output_value().ok_or(TxRejection::ValueOverflow)?;

        if inputs < outputs {
            return Err(TxRejection::InsufficientInputs { inputs, outputs });
        }
        Ok(inputs - outputs)
    }

    /// Mempool admission: full validation plus the minimum fee
    pub fn validate_for_mempool(
        &self,
        tx: &Transaction,
        provider: &dyn UtxoProvider,
        min_fee: u64,
    ) -> Result<u64, TxRejection> {
        let fee = self.validate(tx, provider)?;
        if fee < min_fee {
            return Err(TxRejection::FeeTooLow { fee, min: min_fee });
        }
        Ok(fee)
    }
}

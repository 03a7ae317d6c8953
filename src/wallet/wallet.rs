//! Wallet implementation
//!
//! A single secp256k1 key: address derivation, coin selection and
//! transaction signing. The wallet does NOT affect consensus.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::crypto::{
    address_to_pubkey_hash, pubkey_hash_to_address, PrivateKey, PubKeyHash, PublicKey,
    SignatureError,
};
use crate::storage::Utxo;
use crate::validation::{Transaction, TxInput, TxOutput};

/// Wallet errors
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("Insufficient funds: have {have}, need {need}")]
    InsufficientFunds { have: u64, need: u64 },
    #[error("Signing error: {0}")]
    Signing(#[from] SignatureError),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Cannot access key file: {0}")]
    Io(#[from] std::io::Error),
}

/// A wallet key pair
#[derive(Debug, Clone)]
pub struct KeyPair {
    private_key: PrivateKey,
    pub public_key: PublicKey,
    /// Base58Check of the public key hash
    pub address: String,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_private_key(PrivateKey::generate())
    }

    pub fn from_private_key_bytes(bytes: &[u8; 32]) -> Result<Self, WalletError> {
        Ok(Self::from_private_key(PrivateKey::from_bytes(bytes)?))
    }

    fn from_private_key(private_key: PrivateKey) -> Self {
        let public_key = private_key.public_key();
        let address = pubkey_hash_to_address(&public_key.pubkey_hash());
        Self {
            private_key,
            public_key,
            address,
        }
    }

    pub fn private_key_bytes(&self) -> [u8; 32] {
        self.private_key.to_bytes()
    }

    pub fn pubkey_hash(&self) -> PubKeyHash {
        self.public_key.pubkey_hash()
    }
}

/// Single-key wallet
#[derive(Debug, Clone)]
pub struct Wallet {
    key: KeyPair,
}

impl Default for Wallet {
    fn default() -> Self {
        Self::new()
    }
}

impl Wallet {
    /// Wallet with a freshly generated key
    pub fn new() -> Self {
        Self {
            key: KeyPair::generate(),
        }
    }

    pub fn from_key(key: KeyPair) -> Self {
        Self { key }
    }

    pub fn key(&self) -> &KeyPair {
        &self.key
    }

    pub fn address(&self) -> &str {
        &self.key.address
    }

    pub fn pubkey_hash(&self) -> PubKeyHash {
        self.key.pubkey_hash()
    }

    /// Outputs among `utxos` this wallet can spend
    pub fn spendable<'a>(&self, utxos: &'a [Utxo]) -> impl Iterator<Item = &'a Utxo> {
        let pkh = self.pubkey_hash();
        utxos.iter().filter(move |u| *u.entry.pubkey_hash() == pkh)
    }

    pub fn balance(&self, utxos: &[Utxo]) -> u64 {
        self.spendable(utxos)
            .fold(0u64, |sum, u| sum.saturating_add(u.entry.value()))
    }

    /// Pay `amount` to `recipient`, leaving `fee` to the miner
    ///
    /// Inputs are taken in the given order until they cover amount plus
    /// fee; any remainder returns to this wallet as change.
    pub fn build_transaction(
        &self,
        utxos: &[Utxo],
        recipient: PubKeyHash,
        amount: u64,
        fee: u64,
    ) -> Result<Transaction, WalletError> {
        let need = amount.saturating_add(fee);

        let mut selected = Vec::new();
        let mut have: u64 = 0;
        for utxo in self.spendable(utxos) {
            if have >= need {
                break;
            }
            have = have.saturating_add(utxo.entry.value());
            selected.push(utxo);
        }
        if have < need {
            return Err(WalletError::InsufficientFunds { have, need });
        }

        let mut outputs = vec![TxOutput::new(amount, recipient)];
        let change = have - need;
        if change > 0 {
            outputs.push(TxOutput::new(change, self.pubkey_hash()));
        }

        let inputs = selected
            .iter()
            .map(|utxo| TxInput::new(utxo.outpoint))
            .collect();
        let mut tx = Transaction::new(inputs, outputs);
        for (index, utxo) in selected.iter().enumerate() {
            tx.sign_input(index, &self.key.private_key, &utxo.entry.output)?;
        }
        Ok(tx)
    }

    /// [`Self::build_transaction`] with a Base58Check recipient
    pub fn pay_to_address(
        &self,
        utxos: &[Utxo],
        address: &str,
        amount: u64,
        fee: u64,
    ) -> Result<Transaction, WalletError> {
        let recipient = address_to_pubkey_hash(address)
            .map_err(|e| WalletError::InvalidAddress(e.to_string()))?;
        self.build_transaction(utxos, recipient, amount, fee)
    }

    /// Write the private key as hex
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), WalletError> {
        fs::write(path, hex::encode(self.key.private_key_bytes()))?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, WalletError> {
        let text = fs::read_to_string(path)?;
        let bytes: [u8; 32] = hex::decode(text.trim())
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or(WalletError::Signing(SignatureError::InvalidPrivateKey))?;
        Ok(Self::from_key(KeyPair::from_private_key_bytes(&bytes)?))
    }
}

//! Transaction mempool
//!
//! Transactions waiting for a block, in arrival order. Their UTXO effects
//! live in the full-node service's mempool layer at height 0; this pool
//! only tracks the transactions themselves.

use std::collections::HashSet;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::consensus::Block;
use crate::crypto::Hash;
use crate::storage::FullNodeUtxoService;
use crate::validation::{Transaction, TransactionId, TransactionValidator, TxRejection};

/// Outcome of a post-reorganization cleanup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MempoolCleanup {
    /// Transactions that were dropped as no longer valid
    pub evicted: usize,
    /// Transactions from disconnected blocks taken back into the pool
    pub readmitted: usize,
}

#[derive(Debug, Default)]
pub struct Mempool {
    transactions: Mutex<IndexMap<TransactionId, Transaction>>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `tx` unless already present. Returns whether it was new.
    pub fn add_transaction(&self, tx: Transaction) -> bool {
        let txid = tx.hash();
        let mut transactions = self.transactions.lock();
        if transactions.contains_key(&txid) {
            return false;
        }
        transactions.insert(txid, tx);
        true
    }

    pub fn is_known_transaction_id(&self, txid: &TransactionId) -> bool {
        self.transactions.lock().contains_key(txid)
    }

    /// Transaction ids are transaction hashes, so this is the same lookup
    pub fn is_known_transaction_hash(&self, hash: &Hash) -> bool {
        self.is_known_transaction_id(hash)
    }

    pub fn get_transaction(&self, txid: &TransactionId) -> Option<Transaction> {
        self.transactions.lock().get(txid).cloned()
    }

    /// Snapshot of every pooled transaction in arrival order
    pub fn get_transactions_for_mining(&self) -> Vec<Transaction> {
        self.transactions.lock().values().cloned().collect()
    }

    pub fn get_all_transaction_hashes(&self) -> Vec<Hash> {
        self.transactions.lock().keys().copied().collect()
    }

    pub fn remove_transactions<'a>(&self, txids: impl IntoIterator<Item = &'a TransactionId>) {
        let mut transactions = self.transactions.lock();
        for txid in txids {
            transactions.shift_remove(txid);
        }
    }

    pub fn len(&self) -> usize {
        self.transactions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bring the pool in line with a new main chain
    ///
    /// Expects the full-node mempool layer to hold only the unconfirmed
    /// main-chain blocks. Transactions now included in `connected` are
    /// dropped. Transactions of `disconnected` blocks that the new chain does
    /// not include are offered back first, then the existing pool. Every
    /// candidate is revalidated against `full_node` and applied at height 0;
    /// those that fail are evicted.
    pub fn clean_mempool(
        &self,
        disconnected: &[Block],
        connected: &[Block],
        full_node: &FullNodeUtxoService,
        validator: &TransactionValidator,
        min_fee: u64,
    ) -> MempoolCleanup {
        let confirmed: HashSet<TransactionId> = connected
            .iter()
            .flat_map(|block| block.transactions.iter().map(Transaction::hash))
            .collect();

        let pooled: Vec<Transaction> = {
            let mut transactions = self.transactions.lock();
            transactions.drain(..).map(|(_, tx)| tx).collect()
        };
        let pooled_count = pooled.len();

        let returning = disconnected
            .iter()
            .flat_map(|block| block.transactions.iter().skip(1))
            .cloned();

        let mut seen = HashSet::new();
        let mut kept = Vec::new();
        let mut cleanup = MempoolCleanup::default();
        let mut returning_count = 0;

        for (from_block, tx) in returning
            .map(|tx| (true, tx))
            .chain(pooled.into_iter().map(|tx| (false, tx)))
        {
            let txid = tx.hash();
            if confirmed.contains(&txid) || !seen.insert(txid) {
                continue;
            }
            if from_block {
                returning_count += 1;
            }

            let admitted = validator
                .validate_for_mempool(&tx, full_node, min_fee)
                .and_then(|_| {
                    full_node
                        .apply_transaction(&tx, &txid, 0, 0, false)
                        .map_err(TxRejection::from)
                });
            match admitted {
                Ok(_) => {
                    if from_block {
                        cleanup.readmitted += 1;
                    }
                    kept.push((txid, tx));
                }
                Err(reason) => {
                    debug!(%txid, %reason, "Evicting transaction from mempool");
                    cleanup.evicted += 1;
                }
            }
        }

        let mut transactions = self.transactions.lock();
        transactions.extend(kept);
        debug!(
            pooled = pooled_count,
            returning = returning_count,
            evicted = cleanup.evicted,
            readmitted = cleanup.readmitted,
            "Cleaned mempool"
        );
        cleanup
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::consensus::BlockHeader;
    use crate::crypto::{PrivateKey, PubKeyHash};
    use crate::storage::{Chainstate, MemoryUtxoDao, MempoolUtxo, UtxoEntry};
    use crate::validation::{Outpoint, TxInput, TxOutput};

    fn full_node() -> FullNodeUtxoService {
        let chainstate = Arc::new(Chainstate::with_default_cache(Box::new(MemoryUtxoDao::new())));
        FullNodeUtxoService::new(chainstate, Arc::new(MempoolUtxo::new()), 5)
    }

    fn funded(full_node: &FullNodeUtxoService, key: &PrivateKey, tag: u8) -> (Outpoint, TxOutput) {
        let outpoint = Outpoint::new(Hash([tag; 32]), 0);
        let output = TxOutput::new(100, key.public_key().pubkey_hash());
        full_node
            .chainstate()
            .add(&outpoint, UtxoEntry::new(output, 1, false))
            .unwrap();
        (outpoint, output)
    }

    fn signed_spend(key: &PrivateKey, prev: Outpoint, referenced: &TxOutput, value: u64) -> Transaction {
        let mut tx = Transaction::new(
            vec![TxInput::new(prev)],
            vec![TxOutput::new(value, PubKeyHash([9; 20]))],
        );
        tx.sign_input(0, key, referenced).unwrap();
        tx
    }

    #[test]
    fn test_add_and_lookup() {
        let pool = Mempool::new();
        let tx = Transaction::new(
            vec![TxInput::new(Outpoint::new(Hash([1; 32]), 0))],
            vec![TxOutput::new(1, PubKeyHash::default())],
        );
        let txid = tx.hash();

        assert!(pool.add_transaction(tx.clone()));
        assert!(!pool.add_transaction(tx));
        assert!(pool.is_known_transaction_id(&txid));
        assert!(pool.is_known_transaction_hash(&txid));
        assert_eq!(pool.get_all_transaction_hashes(), vec![txid]);
        assert_eq!(pool.get_transactions_for_mining().len(), 1);

        pool.remove_transactions(&[txid]);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_clean_drops_confirmed_and_conflicting() {
        let node = full_node();
        let key = PrivateKey::generate();
        let (prev, referenced) = funded(&node, &key, 1);

        let pooled = signed_spend(&key, prev, &referenced, 90);
        let conflicting = signed_spend(&key, prev, &referenced, 80);

        let pool = Mempool::new();
        pool.add_transaction(pooled.clone());

        let block = Block::new(
            BlockHeader::new(Hash::zero(), Hash::zero(), 0, 0, 0),
            vec![Transaction::coinbase(2, 50, PubKeyHash::default()), conflicting.clone()],
        );
        // The conflicting spend is now in an unconfirmed main-chain block
        node.apply_transaction(&conflicting, &conflicting.hash(), 2, 1, false)
            .unwrap();

        let cleanup = pool.clean_mempool(&[], &[block], &node, &TransactionValidator::new(), 1);
        assert_eq!(cleanup.evicted, 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_clean_readmits_disconnected() {
        let node = full_node();
        let key = PrivateKey::generate();
        let (prev, referenced) = funded(&node, &key, 1);
        let tx = signed_spend(&key, prev, &referenced, 90);

        let block = Block::new(
            BlockHeader::new(Hash::zero(), Hash::zero(), 0, 0, 0),
            vec![Transaction::coinbase(2, 50, PubKeyHash::default()), tx.clone()],
        );

        let pool = Mempool::new();
        let cleanup = pool.clean_mempool(&[block], &[], &node, &TransactionValidator::new(), 1);
        assert_eq!(cleanup, MempoolCleanup { evicted: 0, readmitted: 1 });
        assert!(pool.is_known_transaction_id(&tx.hash()));
        assert!(node.mempool().is_spent(&prev));
    }
}

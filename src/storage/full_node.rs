//! Full-node UTXO service: the mempool layer read through onto chainstate
//!
//! A block height is confirmed once it exceeds the confirmation depth.
//! Confirmed transactions go to the chainstate, everything else (including
//! height 0, the mempool) lives in the mempool layer. Callers that track
//! the tip themselves pick a side with [`FullNodeUtxoService::commit_transaction`]
//! and [`FullNodeUtxoService::stage_transaction`].

use std::sync::Arc;

use tracing::trace;

use super::{Chainstate, MempoolUtxo, UtxoEntry, UtxoError, UtxoProvider};
use crate::validation::{Outpoint, Transaction, TransactionId};

/// Entries consumed by a transaction, in input order
pub type SpentEntries = Vec<(Outpoint, UtxoEntry)>;

pub struct FullNodeUtxoService {
    chainstate: Arc<Chainstate>,
    mempool: Arc<MempoolUtxo>,
    confirmation_depth: u64,
}

impl FullNodeUtxoService {
    pub fn new(
        chainstate: Arc<Chainstate>,
        mempool: Arc<MempoolUtxo>,
        confirmation_depth: u64,
    ) -> Self {
        Self {
            chainstate,
            mempool,
            confirmation_depth,
        }
    }

    pub fn chainstate(&self) -> &Arc<Chainstate> {
        &self.chainstate
    }

    pub fn mempool(&self) -> &Arc<MempoolUtxo> {
        &self.mempool
    }

    pub fn confirmation_depth(&self) -> u64 {
        self.confirmation_depth
    }

    /// `block_height > confirmation_depth`
    pub fn is_confirmed_height(&self, block_height: u64) -> bool {
        block_height > self.confirmation_depth
    }

    /// Look up an outpoint: spend markers first, then the mempool layer,
    /// then the chainstate
    pub fn get(&self, outpoint: &Outpoint) -> Result<UtxoEntry, UtxoError> {
        if self.mempool.is_spent(outpoint) {
            return Err(UtxoError::AlreadySpent(*outpoint));
        }
        if let Some(entry) = self.mempool.get(outpoint) {
            return Ok(entry);
        }
        self.chainstate.get(outpoint)
    }

    /// Apply `tx` at `block_height`
    ///
    /// Returns the entries its inputs consumed so the caller can revert it
    /// later. Coinbase inputs consume nothing.
    pub fn apply_transaction(
        &self,
        tx: &Transaction,
        txid: &TransactionId,
        block_height: u64,
        tx_index: usize,
        is_coinbase: bool,
    ) -> Result<SpentEntries, UtxoError> {
        let confirmed = self.is_confirmed_height(block_height);
        trace!(%txid, block_height, tx_index, confirmed, "Applying transaction");

        if confirmed {
            self.commit_transaction(tx, txid, block_height, is_coinbase)
        } else {
            self.stage_transaction(tx, txid, block_height, is_coinbase)
        }
    }

    /// Write `tx` into the chainstate whatever its height
    ///
    /// Inputs are taken from the chainstate, or from the mempool layer when
    /// the parent was only staged. Output 0 of a coinbase keeps its flag.
    pub fn commit_transaction(
        &self,
        tx: &Transaction,
        txid: &TransactionId,
        block_height: u64,
        is_coinbase: bool,
    ) -> Result<SpentEntries, UtxoError> {
        let mut spent = Vec::new();
        if !is_coinbase {
            spent.reserve(tx.inputs.len());
            for input in &tx.inputs {
                let outpoint = input.outpoint();
                let entry = match self.chainstate.get(&outpoint) {
                    Ok(entry) => entry,
                    Err(UtxoError::NotFound(_)) => self
                        .mempool
                        .get(&outpoint)
                        .ok_or(UtxoError::NotFound(outpoint))?,
                    Err(e) => return Err(e),
                };
                self.chainstate.remove(&outpoint)?;
                self.mempool.unmark_spent(&outpoint);
                self.mempool.remove(&outpoint);
                spent.push((outpoint, entry));
            }
        }

        for (i, output) in tx.outputs.iter().enumerate() {
            let outpoint = Outpoint::new(*txid, i as u32);
            let entry = UtxoEntry::new(*output, block_height, is_coinbase && i == 0);
            self.chainstate.add(&outpoint, entry)?;
            self.mempool.remove(&outpoint);
        }
        Ok(spent)
    }

    /// Record `tx` in the mempool layer only
    ///
    /// Inputs are marked spent over whatever layer holds them; the chainstate
    /// is left untouched.
    pub fn stage_transaction(
        &self,
        tx: &Transaction,
        txid: &TransactionId,
        block_height: u64,
        is_coinbase: bool,
    ) -> Result<SpentEntries, UtxoError> {
        let mut spent = Vec::new();
        if !is_coinbase {
            spent.reserve(tx.inputs.len());
            for input in &tx.inputs {
                let outpoint = input.outpoint();
                let entry = self.get(&outpoint)?;
                self.mempool.mark_spent(outpoint);
                spent.push((outpoint, entry));
            }
        }

        for (i, output) in tx.outputs.iter().enumerate() {
            self.mempool.add(
                Outpoint::new(*txid, i as u32),
                UtxoEntry::new(*output, block_height, false),
            );
        }
        Ok(spent)
    }

    /// Undo a committed transaction
    ///
    /// Its outputs leave the chainstate and the entries it consumed are put
    /// back. `input_utxos` is what [`Self::apply_transaction`] returned.
    pub fn revert_transaction(
        &self,
        tx: &Transaction,
        txid: &TransactionId,
        input_utxos: &[(Outpoint, UtxoEntry)],
    ) -> Result<(), UtxoError> {
        trace!(%txid, inputs = input_utxos.len(), "Reverting transaction");

        for i in 0..tx.outputs.len() {
            let outpoint = Outpoint::new(*txid, i as u32);
            self.chainstate.remove(&outpoint)?;
            self.mempool.remove(&outpoint);
        }

        for (outpoint, entry) in input_utxos {
            self.chainstate.add(outpoint, *entry)?;
        }
        Ok(())
    }
}

impl UtxoProvider for FullNodeUtxoService {
    fn get(&self, outpoint: &Outpoint) -> Result<UtxoEntry, UtxoError> {
        FullNodeUtxoService::get(self, outpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Hash, PubKeyHash};
    use crate::storage::MemoryUtxoDao;
    use crate::validation::{TxInput, TxOutput};

    fn service() -> FullNodeUtxoService {
        let chainstate = Arc::new(Chainstate::with_default_cache(Box::new(MemoryUtxoDao::new())));
        FullNodeUtxoService::new(chainstate, Arc::new(MempoolUtxo::new()), 5)
    }

    fn funded(service: &FullNodeUtxoService) -> (Outpoint, UtxoEntry, Transaction) {
        let prev = Outpoint::new(Hash([0x0a; 32]), 0);
        let prev_entry = UtxoEntry::new(TxOutput::new(5000, PubKeyHash([1; 20])), 50, false);
        service.chainstate().add(&prev, prev_entry).unwrap();

        let tx = Transaction::new(
            vec![TxInput::new(prev)],
            vec![
                TxOutput::new(4000, PubKeyHash([2; 20])),
                TxOutput::new(900, PubKeyHash([3; 20])),
            ],
        );
        (prev, prev_entry, tx)
    }

    #[test]
    fn test_confirmation_rule() {
        let service = service();
        assert!(!service.is_confirmed_height(0));
        assert!(!service.is_confirmed_height(5));
        assert!(service.is_confirmed_height(6));
        assert!(service.is_confirmed_height(51));
    }

    #[test]
    fn test_mempool_then_confirmed_apply() {
        let service = service();
        let (prev, prev_entry, tx) = funded(&service);
        let txid = tx.hash();

        let spent = service.apply_transaction(&tx, &txid, 0, 1, false).unwrap();
        assert_eq!(spent, vec![(prev, prev_entry)]);
        assert!(matches!(service.get(&prev), Err(UtxoError::AlreadySpent(_))));
        assert_eq!(service.get(&Outpoint::new(txid, 0)).unwrap().value(), 4000);
        assert_eq!(service.get(&Outpoint::new(txid, 1)).unwrap().value(), 900);
        assert!(service.chainstate().get(&prev).is_ok());

        // Reset the mempool layer
        service.mempool().unmark_spent(&prev);
        service.mempool().remove(&Outpoint::new(txid, 0));
        service.mempool().remove(&Outpoint::new(txid, 1));

        service.apply_transaction(&tx, &txid, 51, 1, false).unwrap();
        assert!(matches!(
            service.chainstate().get(&prev),
            Err(UtxoError::NotFound(_))
        ));
        let first = service.chainstate().get(&Outpoint::new(txid, 0)).unwrap();
        assert_eq!((first.value(), first.block_height), (4000, 51));
        let second = service.chainstate().get(&Outpoint::new(txid, 1)).unwrap();
        assert_eq!((second.value(), second.block_height), (900, 51));
        assert!(service.mempool().is_empty());
    }

    #[test]
    fn test_shallow_block_stays_in_mempool_layer() {
        let service = service();
        let (prev, _, tx) = funded(&service);
        let txid = tx.hash();

        service.apply_transaction(&tx, &txid, 5, 1, false).unwrap();
        assert!(service.chainstate().get(&prev).is_ok());
        assert!(service.mempool().is_spent(&prev));
        assert_eq!(service.mempool().get(&Outpoint::new(txid, 0)).unwrap().block_height, 5);
        assert!(matches!(
            service.chainstate().get(&Outpoint::new(txid, 0)),
            Err(UtxoError::NotFound(_))
        ));
    }

    #[test]
    fn test_explicit_commit_ignores_depth() {
        let service = service();
        let (prev, _, tx) = funded(&service);
        let txid = tx.hash();

        service.stage_transaction(&tx, &txid, 2, false).unwrap();
        service.commit_transaction(&tx, &txid, 2, false).unwrap();
        assert!(matches!(
            service.chainstate().get(&prev),
            Err(UtxoError::NotFound(_))
        ));
        assert!(!service.mempool().is_spent(&prev));
        assert_eq!(service.chainstate().get(&Outpoint::new(txid, 1)).unwrap().block_height, 2);
        assert!(service.mempool().is_empty());
    }

    #[test]
    fn test_coinbase_flag_only_on_first_output() {
        let service = service();

        let mut coinbase = Transaction::coinbase_with_data(10, 50, PubKeyHash([1; 20]), b"");
        coinbase.outputs.push(TxOutput::new(1, PubKeyHash([2; 20])));
        let txid = coinbase.hash();

        let spent = service.apply_transaction(&coinbase, &txid, 10, 0, true).unwrap();
        assert!(spent.is_empty());
        assert!(service.get(&Outpoint::new(txid, 0)).unwrap().is_coinbase);
        assert!(!service.get(&Outpoint::new(txid, 1)).unwrap().is_coinbase);
    }

    #[test]
    fn test_revert_restores_inputs() {
        let service = service();

        let prev = Outpoint::new(Hash([7; 32]), 3);
        let prev_entry = UtxoEntry::new(TxOutput::new(100, PubKeyHash([1; 20])), 4, true);
        service.chainstate().add(&prev, prev_entry).unwrap();

        let tx = Transaction::new(
            vec![TxInput::new(prev)],
            vec![TxOutput::new(99, PubKeyHash([2; 20]))],
        );
        let txid = tx.hash();
        let spent = service.apply_transaction(&tx, &txid, 20, 1, false).unwrap();

        service.revert_transaction(&tx, &txid, &spent).unwrap();
        assert_eq!(service.chainstate().get(&prev).unwrap(), prev_entry);
        assert!(service.get(&Outpoint::new(txid, 0)).is_err());
    }
}

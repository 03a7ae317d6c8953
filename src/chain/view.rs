//! Ephemeral UTXO view
//!
//! An overlay over a read-only base provider. Applying transactions records
//! their net effect in `added` and `spent`; the base is never touched.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::storage::{UtxoEntry, UtxoError, UtxoProvider};
use crate::validation::{Outpoint, Transaction, TransactionId};

pub struct UtxoView {
    base: Arc<dyn UtxoProvider>,
    added: HashMap<Outpoint, UtxoEntry>,
    spent: HashSet<Outpoint>,
}

impl UtxoView {
    pub fn new(base: Arc<dyn UtxoProvider>) -> Self {
        Self {
            base,
            added: HashMap::new(),
            spent: HashSet::new(),
        }
    }

    pub fn get(&self, outpoint: &Outpoint) -> Result<UtxoEntry, UtxoError> {
        if self.spent.contains(outpoint) {
            return Err(UtxoError::AlreadySpent(*outpoint));
        }
        if let Some(entry) = self.added.get(outpoint) {
            return Ok(*entry);
        }
        self.base.get(outpoint)
    }

    pub fn contains(&self, outpoint: &Outpoint) -> Result<bool, UtxoError> {
        match self.get(outpoint) {
            Ok(_) => Ok(true),
            Err(UtxoError::NotFound(_)) | Err(UtxoError::AlreadySpent(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Apply `tx` on top of the view
    ///
    /// All inputs are checked before anything changes, so a rejected
    /// transaction leaves the view as it was.
    pub fn apply_tx(
        &mut self,
        tx: &Transaction,
        txid: &TransactionId,
        block_height: u64,
        is_coinbase: bool,
    ) -> Result<(), UtxoError> {
        if !is_coinbase {
            let mut seen = HashSet::with_capacity(tx.inputs.len());
            for input in &tx.inputs {
                let outpoint = input.outpoint();
                if self.spent.contains(&outpoint) || !seen.insert(outpoint) {
                    return Err(UtxoError::AlreadySpent(outpoint));
                }
                if self.added.contains_key(&outpoint) {
                    continue;
                }
                match self.base.get(&outpoint) {
                    Ok(_) => {}
                    Err(UtxoError::AlreadySpent(_)) => {
                        return Err(UtxoError::AlreadySpent(outpoint))
                    }
                    Err(UtxoError::NotFound(_)) => return Err(UtxoError::NotFound(outpoint)),
                    Err(e) => return Err(e),
                }
            }

            for input in &tx.inputs {
                let outpoint = input.outpoint();
                // Created and consumed inside the view: no external effect
                if self.added.remove(&outpoint).is_none() {
                    self.spent.insert(outpoint);
                }
            }
        }

        for (i, output) in tx.outputs.iter().enumerate() {
            self.added.insert(
                Outpoint::new(*txid, i as u32),
                UtxoEntry::new(*output, block_height, is_coinbase && i == 0),
            );
        }
        Ok(())
    }

    pub fn added(&self) -> &HashMap<Outpoint, UtxoEntry> {
        &self.added
    }

    pub fn spent(&self) -> &HashSet<Outpoint> {
        &self.spent
    }

    pub fn into_parts(self) -> (HashMap<Outpoint, UtxoEntry>, HashSet<Outpoint>) {
        (self.added, self.spent)
    }
}

impl UtxoProvider for UtxoView {
    fn get(&self, outpoint: &Outpoint) -> Result<UtxoEntry, UtxoError> {
        UtxoView::get(self, outpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Hash, PubKeyHash};
    use crate::validation::{TxInput, TxOutput};

    fn base_with(outpoint: Outpoint, value: u64) -> Arc<dyn UtxoProvider> {
        let mut map = HashMap::new();
        map.insert(
            outpoint,
            UtxoEntry::new(TxOutput::new(value, PubKeyHash([1; 20])), 3, false),
        );
        Arc::new(map)
    }

    fn spend(prev: Outpoint, value: u64) -> Transaction {
        Transaction::new(
            vec![TxInput::new(prev)],
            vec![TxOutput::new(value, PubKeyHash([2; 20]))],
        )
    }

    #[test]
    fn test_spend_from_base() {
        let prev = Outpoint::new(Hash([1; 32]), 0);
        let mut view = UtxoView::new(base_with(prev, 100));

        let tx = spend(prev, 90);
        let txid = tx.hash();
        view.apply_tx(&tx, &txid, 7, false).unwrap();

        assert!(matches!(view.get(&prev), Err(UtxoError::AlreadySpent(_))));
        assert_eq!(view.get(&Outpoint::new(txid, 0)).unwrap().block_height, 7);
        assert!(view.spent().contains(&prev));
        assert_eq!(view.added().len(), 1);
    }

    #[test]
    fn test_chained_spend_nets_out() {
        let prev = Outpoint::new(Hash([1; 32]), 0);
        let mut view = UtxoView::new(base_with(prev, 100));

        let first = spend(prev, 90);
        let first_id = first.hash();
        view.apply_tx(&first, &first_id, 7, false).unwrap();

        let second = spend(Outpoint::new(first_id, 0), 80);
        let second_id = second.hash();
        view.apply_tx(&second, &second_id, 7, false).unwrap();

        let (added, spent) = view.into_parts();
        assert!(!added.contains_key(&Outpoint::new(first_id, 0)));
        assert!(added.contains_key(&Outpoint::new(second_id, 0)));
        assert_eq!(spent.len(), 1);
    }

    #[test]
    fn test_double_spend_rejected_without_side_effects() {
        let prev = Outpoint::new(Hash([1; 32]), 0);
        let mut view = UtxoView::new(base_with(prev, 100));

        let tx = spend(prev, 90);
        view.apply_tx(&tx, &tx.hash(), 7, false).unwrap();

        let again = spend(prev, 80);
        assert!(matches!(
            view.apply_tx(&again, &again.hash(), 7, false),
            Err(UtxoError::AlreadySpent(_))
        ));
        assert_eq!(view.added().len(), 1);
    }

    #[test]
    fn test_missing_input_not_found() {
        let mut view = UtxoView::new(Arc::new(HashMap::<Outpoint, UtxoEntry>::new()));
        let missing = Outpoint::new(Hash([4; 32]), 1);
        let tx = spend(missing, 1);
        assert!(matches!(
            view.apply_tx(&tx, &tx.hash(), 1, false),
            Err(UtxoError::NotFound(op)) if op == missing
        ));
        assert!(view.spent().is_empty());
        assert!(!view.contains(&missing).unwrap());
    }

    #[test]
    fn test_coinbase_flag() {
        let mut view = UtxoView::new(Arc::new(HashMap::<Outpoint, UtxoEntry>::new()));
        let mut coinbase = Transaction::coinbase(4, 50, PubKeyHash([1; 20]));
        coinbase.outputs.push(TxOutput::new(1, PubKeyHash([1; 20])));
        let txid = coinbase.hash();
        view.apply_tx(&coinbase, &txid, 4, true).unwrap();

        assert!(view.get(&Outpoint::new(txid, 0)).unwrap().is_coinbase);
        assert!(!view.get(&Outpoint::new(txid, 1)).unwrap().is_coinbase);
    }
}

//! Outbound message seam
//!
//! The core never talks to sockets. Everything it wants to tell the network
//! goes through a [`BlockchainMessageSender`] supplied by the transport.

use tracing::trace;

use super::{InvItem, PeerId};
use crate::consensus::{Block, BlockHeader};
use crate::crypto::Hash;
use crate::validation::Transaction;

pub trait BlockchainMessageSender: Send + Sync {
    fn send_get_data(&self, peer: PeerId, items: &[InvItem]);

    fn send_inv(&self, peer: PeerId, items: &[InvItem]);

    fn send_block(&self, peer: PeerId, block: &Block);

    fn send_tx(&self, peer: PeerId, tx: &Transaction);

    fn send_headers(&self, peer: PeerId, headers: &[BlockHeader]);

    /// Announce `items` to every peer except `exclude`
    fn broadcast_inv_exclusionary(&self, items: &[InvItem], exclude: Option<PeerId>);

    /// Announce newly connected blocks to every peer except `exclude`
    fn broadcast_added_blocks(&self, hashes: &[Hash], exclude: Option<PeerId>);

    /// Ask for the headers leading to `missing`, starting after `locator`
    fn request_missing_block_headers(&self, peer: Option<PeerId>, locator: &[Hash], missing: Hash);
}

/// Sender for a node without a network: logs and drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMessageSender;

impl BlockchainMessageSender for NullMessageSender {
    fn send_get_data(&self, peer: PeerId, items: &[InvItem]) {
        trace!(%peer, items = items.len(), "Dropping getdata");
    }

    fn send_inv(&self, peer: PeerId, items: &[InvItem]) {
        trace!(%peer, items = items.len(), "Dropping inv");
    }

    fn send_block(&self, peer: PeerId, block: &Block) {
        trace!(%peer, block = %block.hash(), "Dropping block");
    }

    fn send_tx(&self, peer: PeerId, tx: &Transaction) {
        trace!(%peer, txid = %tx.hash(), "Dropping tx");
    }

    fn send_headers(&self, peer: PeerId, headers: &[BlockHeader]) {
        trace!(%peer, headers = headers.len(), "Dropping headers");
    }

    fn broadcast_inv_exclusionary(&self, items: &[InvItem], exclude: Option<PeerId>) {
        trace!(items = items.len(), ?exclude, "Dropping inv broadcast");
    }

    fn broadcast_added_blocks(&self, hashes: &[Hash], exclude: Option<PeerId>) {
        trace!(blocks = hashes.len(), ?exclude, "Dropping block announcement");
    }

    fn request_missing_block_headers(&self, peer: Option<PeerId>, locator: &[Hash], missing: Hash) {
        trace!(?peer, locator = locator.len(), %missing, "Dropping header request");
    }
}

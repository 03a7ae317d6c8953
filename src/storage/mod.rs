//! Storage module - UTXO entries, chainstate, the unconfirmed layer and undo data

mod db;
mod full_node;
mod memory;
mod mempool;
mod state;
mod undo;
mod utxo;

pub use db::*;
pub use full_node::*;
pub use memory::*;
pub use mempool::*;
pub use state::*;
pub use undo::*;
pub use utxo::*;

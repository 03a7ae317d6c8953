//! Chain module - Block forest, UTXO views, side-chain deltas, reorganization
//! and the blockchain orchestrator

mod blockchain;
mod delta;
mod error;
mod forest;
mod multichain;
mod reorg;
mod view;

pub use blockchain::*;
pub use delta::*;
pub use error::*;
pub use forest::*;
pub use multichain::*;
pub use reorg::*;
pub use view::*;

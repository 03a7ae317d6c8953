//! P2P module - Inventory items, peer ids and the outbound message seam

mod protocol;
mod sender;

pub use protocol::*;
pub use sender::*;

//! Mempool module - Pending transactions and post-reorganization cleanup

mod pool;

pub use pool::*;

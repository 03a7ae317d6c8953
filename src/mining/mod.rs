//! Mining module - Candidate assembly and proof-of-work search

mod miner;

pub use miner::*;

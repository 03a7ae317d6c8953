//! Consensus module - Block structure, validation, difficulty, rewards and parameters

mod block;
mod difficulty;
mod params;
mod rewards;
mod validation;

pub use block::*;
pub use difficulty::*;
pub use params::*;
pub use rewards::*;
pub use validation::*;

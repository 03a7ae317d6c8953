//! Validation module - transactions and their validator

mod transaction;
mod validator;

pub use transaction::*;
pub use validator::*;

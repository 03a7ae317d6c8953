//! Node module - Genesis block and node configuration

mod config;
mod genesis;

pub use config::*;
pub use genesis::*;

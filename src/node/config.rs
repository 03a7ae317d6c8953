//! Node configuration
//!
//! Layered: defaults, then an optional JSON file, then the `P2P_PORT` and
//! `APP_PORT` environment variables. Command-line flags are applied by the
//! binary on top.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consensus::ChainParams;
use crate::constants::{
    CONFIRMATION_DEPTH, DEFAULT_APP_PORT, DEFAULT_CACHE_SIZE, DEFAULT_DIFFICULTY,
    DEFAULT_P2P_PORT, TX_PER_BLOCK,
};
use crate::crypto::{address_to_pubkey_hash, PubKeyHash};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Cannot parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainstateConfig {
    /// LRU capacity, must be positive
    pub cache_size: usize,
    pub db_path: Option<PathBuf>,
    /// Ignored when `db_path` is set
    pub in_memory: bool,
}

impl Default for ChainstateConfig {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_CACHE_SIZE,
            db_path: None,
            in_memory: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiningConfig {
    pub enabled: bool,
    /// Base58Check address receiving block rewards
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub p2p_port: u16,
    pub app_port: u16,
    pub chainstate: ChainstateConfig,
    pub confirmation_depth: u64,
    pub difficulty: u8,
    /// Coinbase included
    pub tx_per_block: usize,
    pub mining: MiningConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            p2p_port: DEFAULT_P2P_PORT,
            app_port: DEFAULT_APP_PORT,
            chainstate: ChainstateConfig::default(),
            confirmation_depth: CONFIRMATION_DEPTH,
            difficulty: DEFAULT_DIFFICULTY,
            tx_per_block: TX_PER_BLOCK,
            mining: MiningConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Defaults overlaid with `path` (if any) and the process environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_json(&fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        config.apply_env(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Apply `P2P_PORT` and `APP_PORT` through `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(port) = lookup("P2P_PORT") {
            self.p2p_port = parse_port("P2P_PORT", &port)?;
        }
        if let Some(port) = lookup("APP_PORT") {
            self.app_port = parse_port("APP_PORT", &port)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chainstate.cache_size == 0 {
            return Err(ConfigError::Invalid(
                "chainstate.cache_size must be positive".into(),
            ));
        }
        if self.tx_per_block == 0 {
            return Err(ConfigError::Invalid("tx_per_block must be at least 1".into()));
        }
        if self.mining.enabled && self.mining.address.is_none() {
            return Err(ConfigError::Invalid(
                "mining.enabled requires mining.address".into(),
            ));
        }
        self.mining_pubkey_hash()?;
        Ok(())
    }

    pub fn chain_params(&self) -> ChainParams {
        ChainParams::default()
            .with_confirmation_depth(self.confirmation_depth)
            .with_difficulty(self.difficulty)
            .with_tx_per_block(self.tx_per_block)
    }

    /// Whether the chainstate lives only in memory
    pub fn is_in_memory(&self) -> bool {
        self.chainstate.db_path.is_none()
    }

    /// Decoded mining address, if configured
    pub fn mining_pubkey_hash(&self) -> Result<Option<PubKeyHash>, ConfigError> {
        self.mining
            .address
            .as_deref()
            .map(|address| {
                address_to_pubkey_hash(address)
                    .map_err(|e| ConfigError::Invalid(format!("mining.address: {e}")))
            })
            .transpose()
    }
}

fn parse_port(name: &str, value: &str) -> Result<u16, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{name} must be a port number, got {value:?}")))
}

//! Bitforest Node
//!
//! Runs a single node: opens the chainstate, replays the block archive and
//! optionally mines on top of the main chain until Ctrl+C.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bitforest_core::chain::Blockchain;
use bitforest_core::crypto::pubkey_hash_to_address;
use bitforest_core::mining::{Miner, MiningResult};
use bitforest_core::node::NodeConfig;
use bitforest_core::p2p::NullMessageSender;
use bitforest_core::storage::ChainDb;
use bitforest_core::wallet::Wallet;

#[derive(Debug, Parser)]
#[command(name = "bitforest-node", version, about = "Bitforest full node")]
struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Chainstate directory; overrides the config file
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Keep the chainstate in memory even if a path is configured
    #[arg(long)]
    in_memory: bool,

    /// Mine blocks
    #[arg(long)]
    mine: bool,

    /// Address receiving block rewards
    #[arg(long)]
    mining_address: Option<String>,

    /// Key file for the mining wallet, created if missing
    #[arg(long, conflicts_with = "mining_address")]
    wallet: Option<PathBuf>,

    #[arg(long)]
    difficulty: Option<u8>,

    #[arg(long)]
    p2p_port: Option<u16>,

    #[arg(long)]
    app_port: Option<u16>,
}

impl Cli {
    fn apply(&self, config: &mut NodeConfig) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(path) = &self.db_path {
            config.chainstate.db_path = Some(path.clone());
        }
        if self.in_memory {
            config.chainstate.db_path = None;
        }
        if self.mine {
            config.mining.enabled = true;
        }
        if let Some(address) = &self.mining_address {
            config.mining.address = Some(address.clone());
        }
        if let Some(path) = &self.wallet {
            let wallet = if path.exists() {
                Wallet::load(path)?
            } else {
                let wallet = Wallet::new();
                wallet.save(path)?;
                info!(path = %path.display(), "Created wallet");
                wallet
            };
            config.mining.address = Some(wallet.address().to_string());
        }
        if let Some(difficulty) = self.difficulty {
            config.difficulty = difficulty;
        }
        if let Some(port) = self.p2p_port {
            config.p2p_port = port;
        }
        if let Some(port) = self.app_port {
            config.app_port = port;
        }
        Ok(())
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("bitforest_core=info,bitforest_node=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = NodeConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config)?;
    config.validate()?;

    let params = config.chain_params();
    let cache_size = NonZeroUsize::new(config.chainstate.cache_size)
        .ok_or("chainstate.cache_size must be positive")?;
    let db = match &config.chainstate.db_path {
        Some(path) => Some(ChainDb::open(path)?),
        None => None,
    };
    info!(
        in_memory = config.is_in_memory(),
        difficulty = params.difficulty,
        confirmation_depth = params.confirmation_depth,
        p2p_port = config.p2p_port,
        app_port = config.app_port,
        "Starting node"
    );

    let chain = Arc::new(Blockchain::open(
        params,
        db.as_ref(),
        cache_size,
        Arc::new(NullMessageSender),
    )?);
    let (tip, height) = chain.main_chain_tip();
    info!(genesis = %chain.genesis_hash(), %tip, height, "Chain ready");

    let miner = match config.mining_pubkey_hash()? {
        Some(pkh) if config.mining.enabled => Some(Miner::new(pkh)),
        _ => None,
    };
    let mining_task = miner.clone().map(|miner| {
        let chain = Arc::clone(&chain);
        tokio::task::spawn_blocking(move || mine_forever(&miner, &chain))
    });
    if miner.is_some() {
        let address = config.mining.address.as_deref().unwrap_or_default();
        info!(%address, "Mining enabled");
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    if let Some(miner) = &miner {
        miner.stop_mining();
    }
    if let Some(task) = mining_task {
        if let Err(e) = task.await {
            warn!(error = %e, "Mining task ended abnormally");
        }
    }

    chain.close()?;
    if let Some(db) = &db {
        db.flush()?;
    }
    Ok(())
}

/// Mine until the miner is stopped
fn mine_forever(miner: &Miner, chain: &Blockchain) {
    loop {
        match miner.start_mining(chain) {
            Ok(MiningResult::Success(block)) => {
                let (_, height) = chain.main_chain_tip();
                if let Some(reward) = block.transactions.first().and_then(|cb| cb.outputs.first()) {
                    let payee = pubkey_hash_to_address(&reward.pubkey_hash);
                    info!(block = %block.hash(), height, reward = reward.value, %payee, "Block added");
                }
            }
            Ok(MiningResult::Interrupted) => {
                info!("Miner stopped");
                return;
            }
            Err(e) => error!(error = %e, "Mined block rejected"),
        }
    }
}

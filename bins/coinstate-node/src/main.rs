//! coinstate node binary.
//!
//! Opens a data directory, reports its coin and block file state, and runs
//! manual pruning.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use coinstate_node_lib::error::ConfigError;
use coinstate_node_lib::logging::init_logging;
use coinstate_node_lib::{Node, NodeConfig};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "coinstate-node",
    version,
    about = "Coin cache and block file store for a UTXO chain"
)]
struct Args {
    /// Configuration file (TOML). `COINSTATE_*` variables override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory for the chainstate database and block files
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format ("text" or "json")
    #[arg(long)]
    log_format: Option<String>,

    /// Prune target in MiB: 0 disables pruning, 1 allows manual pruning only
    #[arg(long)]
    prune: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the chain tip and per-file block storage usage
    Status,
    /// Delete block and undo files that hold nothing above HEIGHT
    Prune { height: u32 },
}

impl Args {
    /// Layer command-line flags over the loaded configuration.
    fn into_config(self) -> Result<(NodeConfig, Command), ConfigError> {
        let mut config = NodeConfig::load(self.config.as_deref())?;
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        if let Some(mib) = self.prune {
            config.prune_target_mib = mib;
        }
        config.validate()?;
        Ok((config, self.command))
    }
}

fn main() {
    let args = Args::parse();
    let (config, command) = match args.into_config() {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            process::exit(2);
        }
    };

    if let Err(e) = init_logging(&config.log_level, &config.log_format) {
        eprintln!("failed to initialize logging: {e}");
        process::exit(1);
    }

    info!("coinstate node v{}", env!("CARGO_PKG_VERSION"));
    info!("data_dir: {:?}", config.data_dir);

    let node = match Node::open(config) {
        Ok(node) => node,
        Err(e) => {
            error!("failed to open node: {}", e);
            process::exit(1);
        }
    };

    match command {
        Command::Status => report_status(&node),
        Command::Prune { height } => match node.prune_manual(height) {
            Ok(files) => info!(height, files = ?files, "manual prune complete"),
            Err(e) => {
                error!("prune failed: {}", e);
                process::exit(1);
            }
        },
    }
}

fn report_status(node: &Node) {
    let tip = node.tip();
    match tip.height {
        Some(height) => info!("chain_tip: height={} hash={}", height, tip.hash),
        None => info!("chain_tip: none"),
    }

    let files = node.block_files();
    info!(
        last_block_file = files.last_block_file(),
        usage_bytes = files.calculate_current_usage(),
        coins_cache_bytes = node.coins_cache_usage(),
        "block storage"
    );
    for file in 0..files.file_count() as u32 {
        let info = files.get_block_file_info(file);
        if info.blocks() > 0 {
            info!("blk{:05}: {}", file, info);
        }
    }
}

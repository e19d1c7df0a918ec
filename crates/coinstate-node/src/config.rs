//! Node configuration.
//!
//! [`NodeConfig`] is the serializable, file- and environment-loadable form.
//! [`BlockStoreConfig`] is the runtime view consumed by the block-file store,
//! derived from it with [`NodeConfig::block_store`].
//!
//! Sources, later ones overriding earlier ones:
//! 1. built-in defaults
//! 2. an optional TOML file
//! 3. `COINSTATE_*` environment variables (`COINSTATE_PRUNE_TARGET_MIB=1000`)

use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::info;

use coinstate_core::constants::DEFAULT_GENESIS_ACTIVATION_HEIGHT;

use crate::error::ConfigError;

pub const ONE_MEBIBYTE: u64 = 1024 * 1024;

/// Files are closed for new blocks once they would reach this size.
pub const DEFAULT_PREFERRED_BLOCK_FILE_SIZE: u64 = 128 * ONE_MEBIBYTE;

/// Blocks this close to the tip are never pruned.
pub const DEFAULT_MIN_BLOCKS_TO_KEEP: u32 = 288;

/// Smallest automatic prune target accepted.
pub const MIN_DISK_SPACE_FOR_BLOCK_FILES: u64 = 550 * ONE_MEBIBYTE;

/// Automatic pruning does not start until the chain is taller than this.
pub const DEFAULT_PRUNE_AFTER_HEIGHT: u32 = 100_000;

pub const DEFAULT_MAX_COINS_CACHE_BYTES: u64 = 450 * ONE_MEBIBYTE;

/// How block and undo files are pruned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneMode {
    Disabled,
    /// Only on explicit request, up to a given height.
    Manual,
    /// Keep block and undo files under a byte budget.
    Automatic { target_bytes: u64 },
}

impl PruneMode {
    /// Interpret a prune target in MiB: 0 disables pruning, 1 allows manual
    /// pruning only, anything else is an automatic target of at least
    /// [`MIN_DISK_SPACE_FOR_BLOCK_FILES`].
    pub fn from_target_mib(mib: u64) -> Result<Self, ConfigError> {
        match mib {
            0 => Ok(Self::Disabled),
            1 => Ok(Self::Manual),
            _ => {
                let target_bytes = mib.saturating_mul(ONE_MEBIBYTE);
                if target_bytes < MIN_DISK_SPACE_FOR_BLOCK_FILES {
                    return Err(ConfigError::Invalid(format!(
                        "prune target of {mib} MiB is below the minimum of {} MiB",
                        MIN_DISK_SPACE_FOR_BLOCK_FILES / ONE_MEBIBYTE
                    )));
                }
                Ok(Self::Automatic { target_bytes })
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }

    /// Byte budget for automatic pruning.
    pub fn target_bytes(&self) -> Option<u64> {
        match self {
            Self::Automatic { target_bytes } => Some(*target_bytes),
            _ => None,
        }
    }
}

/// Parameters of block file placement and pruning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockStoreConfig {
    pub preferred_block_file_size: u64,
    pub min_blocks_to_keep: u32,
    pub prune_mode: PruneMode,
}

impl Default for BlockStoreConfig {
    fn default() -> Self {
        Self {
            preferred_block_file_size: DEFAULT_PREFERRED_BLOCK_FILE_SIZE,
            min_blocks_to_keep: DEFAULT_MIN_BLOCKS_TO_KEEP,
            prune_mode: PruneMode::Disabled,
        }
    }
}

/// Configuration for a node instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    /// Log level filter string (e.g. "info", "debug", "coinstate_node_lib=trace").
    pub log_level: String,
    /// "text" or "json".
    pub log_format: String,
    pub preferred_block_file_size: u64,
    pub min_blocks_to_keep: u32,
    /// 0 = no pruning, 1 = manual only, otherwise target size in MiB.
    pub prune_target_mib: u64,
    pub prune_after_height: u32,
    pub genesis_activation_height: u32,
    /// Flush the coin cache once it holds more than this many bytes.
    pub max_coins_cache_bytes: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("coinstate");

        Self {
            data_dir,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            preferred_block_file_size: DEFAULT_PREFERRED_BLOCK_FILE_SIZE,
            min_blocks_to_keep: DEFAULT_MIN_BLOCKS_TO_KEEP,
            prune_target_mib: 0,
            prune_after_height: DEFAULT_PRUNE_AFTER_HEIGHT,
            genesis_activation_height: DEFAULT_GENESIS_ACTIVATION_HEIGHT,
            max_coins_cache_bytes: DEFAULT_MAX_COINS_CACHE_BYTES,
        }
    }
}

impl NodeConfig {
    /// Load defaults, then `path` if given, then `COINSTATE_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, Self::environment())
    }

    /// Like [`load`](Self::load) with an explicit environment source.
    pub fn load_with_env(path: Option<&Path>, env: Environment) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);
        if let Some(path) = path {
            info!(path = %path.display(), "loading configuration file");
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(env);

        let config: NodeConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// The `COINSTATE_` environment source. Nested keys are not used, so the
    /// key separator is `__` to keep underscores in field names intact.
    pub fn environment() -> Environment {
        Environment::with_prefix("COINSTATE")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.preferred_block_file_size == 0 {
            return Err(ConfigError::Invalid(
                "preferred_block_file_size must be positive".into(),
            ));
        }
        if !matches!(self.log_format.as_str(), "text" | "json") {
            return Err(ConfigError::Invalid(format!(
                "unknown log_format {:?}, expected \"text\" or \"json\"",
                self.log_format
            )));
        }
        PruneMode::from_target_mib(self.prune_target_mib)?;
        Ok(())
    }

    pub fn block_store(&self) -> Result<BlockStoreConfig, ConfigError> {
        Ok(BlockStoreConfig {
            preferred_block_file_size: self.preferred_block_file_size,
            min_blocks_to_keep: self.min_blocks_to_keep,
            prune_mode: PruneMode::from_target_mib(self.prune_target_mib)?,
        })
    }

    /// Path to the RocksDB coin and block index database.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("chainstate")
    }

    /// Directory holding `blk*.dat` and `rev*.dat` files.
    pub fn blocks_dir(&self) -> PathBuf {
        self.data_dir.join("blocks")
    }

    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(self.db_path())?;
        std::fs::create_dir_all(self.blocks_dir())?;
        Ok(())
    }
}

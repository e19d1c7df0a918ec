//! Error types for block storage and node wiring.

use thiserror::Error;

use coinstate_core::error::CoinsError;
use coinstate_core::types::Hash256;

/// Errors from block and undo file placement and access.
#[derive(Error, Debug)]
pub enum BlockFileError {
    #[error("out of disk space")] OutOfDiskSpace,
    #[error("block file io: {0}")] Io(#[from] std::io::Error),
}

/// Errors from the RocksDB-backed stores.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("rocksdb: {0}")] Rocks(String),
    #[error("missing column family: {0}")] MissingColumnFamily(String),
    #[error("encoding: {0}")] Encoding(String),
    #[error("corrupt record: {0}")] Corrupt(String),
}

impl From<StorageError> for CoinsError {
    fn from(e: StorageError) -> Self {
        CoinsError::Backend(e.to_string())
    }
}

/// Errors from loading or validating [`NodeConfig`](crate::config::NodeConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config source: {0}")] Source(#[from] config::ConfigError),
    #[error("invalid config: {0}")] Invalid(String),
    #[error("data directory: {0}")] Io(#[from] std::io::Error),
}

/// Top-level node errors.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)] Coins(#[from] CoinsError),
    #[error(transparent)] BlockFile(#[from] BlockFileError),
    #[error(transparent)] Storage(#[from] StorageError),
    #[error(transparent)] Config(#[from] ConfigError),
    #[error("block {hash} does not extend tip {tip}")] NotOnTip { hash: Hash256, tip: Hash256 },
    #[error("transaction {0} spends a missing or already spent coin")] MissingInputs(Hash256),
    #[error("block {0} is not the current tip")] NotTip(Hash256),
    #[error("pruning is disabled")] PruningDisabled,
}

//! # coinstate-node-lib
//!
//! Persistent side of the coinstate engine:
//! - [`block_files::BlockFileInfoStore`]: block file placement, space accounting and prune selection
//! - [`block_file_access::FlatFileAccess`]: `blk`/`rev` files on disk
//! - [`storage::RocksStore`] and [`storage::RocksCoinsView`]: coins and block file records in RocksDB
//! - [`node::Node`]: accepting, disconnecting and flushing blocks
//! - [`config::NodeConfig`] and [`logging::init_logging`]: configuration and tracing setup

pub mod block_file_access;
pub mod block_files;
pub mod config;
pub mod error;
pub mod logging;
pub mod node;
pub mod storage;

pub use block_files::BlockFileInfoStore;
pub use config::NodeConfig;
pub use error::NodeError;
pub use node::Node;
pub use storage::{RocksCoinsView, RocksStore};

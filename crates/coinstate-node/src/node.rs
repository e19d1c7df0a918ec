//! Node composition.
//!
//! The [`Node`] struct wires the RocksDB coin view, the flat block files and
//! the block-file accounting together. Accepting a block places and writes
//! it, connects it to the coin set through a per-block [`CoinsViewCache`],
//! and stores its undo data in the matching undo file. State reaches disk in
//! [`Node::flush_state`], which is also where automatic pruning happens.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use coinstate_core::cancellation::CancellationToken;
use coinstate_core::coin::CoinWithScript;
use coinstate_core::coins_cache::CoinsViewCache;
use coinstate_core::traits::{CoinsView, CoinsViewWrite};
use coinstate_core::types::{Block, Hash256, OutPoint};
use coinstate_core::undo::{self, BlockUndo, DisconnectResult};

use crate::block_file_access::FlatFileAccess;
use crate::block_files::{BlockFileInfo, BlockFileInfoStore, ChainTip, DiskBlockPos};
use crate::config::{BlockStoreConfig, NodeConfig};
use crate::error::{NodeError, StorageError};
use crate::storage::{BlockTreeDb, RocksCoinsView, RocksStore};

/// Height and hash of the active chain's tip. `height` is `None` before the
/// first block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChainTipState {
    pub height: Option<u32>,
    pub hash: Hash256,
}

impl ChainTip for ChainTipState {
    fn tip_height(&self) -> Option<u32> {
        self.height
    }
}

/// Where an accepted block and its undo data were written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLocation {
    pub hash: Hash256,
    pub height: u32,
    pub block_pos: DiskBlockPos,
    pub block_size: u64,
    pub undo_pos: DiskBlockPos,
    pub undo_size: u64,
}

/// A coin-state node over one data directory.
pub struct Node {
    config: NodeConfig,
    block_config: BlockStoreConfig,
    store: Arc<RocksStore>,
    /// Writers hold the lock for the whole of a block connect or disconnect.
    coins: RwLock<RocksCoinsView>,
    files: Arc<FlatFileAccess>,
    block_files: BlockFileInfoStore,
    chain: Mutex<ChainTipState>,
    check_for_pruning: AtomicBool,
}

impl Node {
    /// Open the node's database and block files under `config.data_dir`.
    pub fn open(config: NodeConfig) -> Result<Self, NodeError> {
        let files = FlatFileAccess::new(config.blocks_dir())?;
        Self::with_file_access(config, files)
    }

    /// Like [`open`](Self::open) with a caller-supplied file layer.
    pub fn with_file_access(config: NodeConfig, files: FlatFileAccess) -> Result<Self, NodeError> {
        config.validate()?;
        config.ensure_directories()?;
        let block_config = config.block_store()?;

        let store = Arc::new(RocksStore::open(config.db_path())?);
        let files = Arc::new(files);
        let block_files = BlockFileInfoStore::new(files.clone());
        if let Some(last) = store.read_last_block_file()? {
            block_files.load_block_file_info(last, store.as_ref())?;
        }

        let coins = RocksCoinsView::new(store.clone());
        let chain = ChainTipState {
            height: store.tip_height()?,
            hash: coins.get_best_block()?,
        };
        info!(
            data_dir = %config.data_dir.display(),
            tip_height = ?chain.height,
            tip = %chain.hash,
            prune = ?block_config.prune_mode,
            "node opened"
        );

        Ok(Self {
            config,
            block_config,
            store,
            coins: RwLock::new(coins),
            files,
            block_files,
            chain: Mutex::new(chain),
            check_for_pruning: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn tip(&self) -> ChainTipState {
        *self.chain.lock()
    }

    pub fn block_files(&self) -> &BlockFileInfoStore {
        &self.block_files
    }

    pub fn file_access(&self) -> &FlatFileAccess {
        &self.files
    }

    /// Unspent coin at `outpoint`, script included.
    pub fn coin(&self, outpoint: &OutPoint) -> Result<Option<CoinWithScript>, NodeError> {
        let coins = self.coins.read();
        let cache = CoinsViewCache::new(&*coins);
        Ok(cache
            .get_coin_with_script(outpoint)?
            .filter(|coin| !coin.is_spent()))
    }

    /// Bytes held by the in-memory coin level.
    pub fn coins_cache_usage(&self) -> usize {
        self.coins.read().dynamic_memory_usage()
    }

    /// Connect `block` on top of the current tip.
    ///
    /// Every input must be an unspent coin, either already in the coin set
    /// or created earlier in the same block. Flushes state when the coin
    /// cache outgrows its limit or a new file chunk was allocated while
    /// pruning is enabled.
    pub fn accept_block(&self, block: &Block) -> Result<BlockLocation, NodeError> {
        let mut coins = self.coins.write();
        let hash = block.hash()?;
        let tip = self.tip();
        let height = match tip.height {
            Some(tip_height) if block.prev_block == tip.hash => tip_height + 1,
            Some(_) => return Err(NodeError::NotOnTip { hash, tip: tip.hash }),
            None => 0,
        };
        let gah = self.config.genesis_activation_height;

        let mut cache = CoinsViewCache::new(&*coins);
        check_block_inputs(&cache, block, height >= gah)?;

        let bytes = bincode::encode_to_vec(block, bincode::config::standard())
            .map_err(|e| StorageError::Encoding(e.to_string()))?;
        let block_size = bytes.len() as u64;
        let placed = self.block_files.find_block_pos(
            &self.block_config,
            block_size,
            height,
            u64::from(block.time),
            None,
        )?;
        if placed.check_for_pruning {
            self.check_for_pruning.store(true, Ordering::Relaxed);
        }
        self.files.write_block(placed.pos, &bytes)?;

        // The coin set is only touched once the undo data is on disk.
        let block_undo = undo::connect_block(&mut cache, block, height, gah)?;
        let undo_bytes = block_undo.to_bytes()?;
        let undo_size = undo_bytes.len() as u64;
        let undo_placed = self
            .block_files
            .find_undo_pos(&self.block_config, placed.pos.file, undo_size)?;
        if undo_placed.check_for_pruning {
            self.check_for_pruning.store(true, Ordering::Relaxed);
        }
        self.files.write_undo(undo_placed.pos, &undo_bytes)?;

        let changes = cache.into_changes();
        coins.batch_write(changes)?;

        *self.chain.lock() = ChainTipState {
            height: Some(height),
            hash,
        };
        let usage = coins.dynamic_memory_usage() as u64;
        drop(coins);

        info!(%hash, height, pos = %placed.pos, size = block_size, "accepted block");

        if usage > self.config.max_coins_cache_bytes || self.check_for_pruning.load(Ordering::Relaxed) {
            self.flush_state()?;
        }

        Ok(BlockLocation {
            hash,
            height,
            block_pos: placed.pos,
            block_size,
            undo_pos: undo_placed.pos,
            undo_size,
        })
    }

    /// Read back a block written by [`accept_block`](Self::accept_block).
    pub fn read_block(&self, location: &BlockLocation) -> Result<Block, NodeError> {
        let bytes = self
            .files
            .read_block(location.block_pos, location.block_size as usize)?;
        let (block, _) = bincode::decode_from_slice(&bytes, bincode::config::standard())
            .map_err(|e| StorageError::Encoding(e.to_string()))?;
        Ok(block)
    }

    /// Disconnect the tip block using its stored undo data.
    ///
    /// Nothing is applied unless the rollback runs to completion: on
    /// cancellation or [`DisconnectResult::Failed`] the coin set and tip
    /// are left as they were.
    pub fn disconnect_tip(
        &self,
        block: &Block,
        location: &BlockLocation,
        token: &CancellationToken,
    ) -> Result<DisconnectResult, NodeError> {
        let mut coins = self.coins.write();
        let tip = self.tip();
        if tip.height != Some(location.height) || tip.hash != location.hash || block.hash()? != location.hash {
            return Err(NodeError::NotTip(location.hash));
        }

        let undo_bytes = self
            .files
            .read_undo(location.undo_pos, location.undo_size as usize)?;
        let block_undo = BlockUndo::from_bytes(&undo_bytes)?;

        let mut cache = CoinsViewCache::new(&*coins);
        let result = undo::apply_block_undo(
            &mut cache,
            block,
            &block_undo,
            location.height,
            self.config.genesis_activation_height,
            token,
        )?;
        if result == DisconnectResult::Failed {
            warn!(hash = %location.hash, height = location.height, "failed to disconnect block");
            return Ok(result);
        }
        let changes = cache.into_changes();
        coins.batch_write(changes)?;

        *self.chain.lock() = ChainTipState {
            height: location.height.checked_sub(1),
            hash: block.prev_block,
        };
        info!(hash = %location.hash, height = location.height, ?result, "disconnected block");
        Ok(result)
    }

    /// Write block-file records, coins and the tip height to disk, pruning
    /// first if a prune check is pending.
    pub fn flush_state(&self) -> Result<(), NodeError> {
        // Blocks writers, so the coins and the tip height stored below
        // describe the same block.
        let coins = self.coins.read();
        let tip = self.tip();

        let prune_requested = self.check_for_pruning.swap(false, Ordering::Relaxed);
        let to_prune = if prune_requested {
            self.block_files.find_files_to_prune(
                &self.block_config,
                &self.chain,
                self.config.prune_after_height,
            )
        } else {
            BTreeSet::new()
        };
        if let Err(e) = self.write_block_files(&to_prune) {
            if prune_requested {
                self.check_for_pruning.store(true, Ordering::Relaxed);
            }
            return Err(e);
        }

        let written = coins.flush()?;
        self.store.set_tip_height(tip.height)?;
        drop(coins);

        if !to_prune.is_empty() {
            self.files.remove_files(&to_prune)?;
        }
        debug!(coins = written, pruned = to_prune.len(), "flushed node state");
        Ok(())
    }

    /// Prune block files holding nothing above `height`, keeping the
    /// configured minimum of recent blocks. Returns the files removed.
    pub fn prune_manual(&self, height: u32) -> Result<BTreeSet<u32>, NodeError> {
        if !self.block_config.prune_mode.is_enabled() {
            return Err(NodeError::PruningDisabled);
        }
        if height == 0 {
            return Ok(BTreeSet::new());
        }

        let to_prune = self
            .block_files
            .find_files_to_prune_manual(&self.block_config, &self.chain, height);
        self.write_block_files(&to_prune)?;
        self.files.remove_files(&to_prune)?;
        Ok(to_prune)
    }

    /// Store every dirty block-file record, with the records of `pruned`
    /// written as empty. In-memory records change only after the write
    /// succeeds; on failure the dirty records stay dirty. Clearing marks the
    /// pruned records dirty again, so the next flush rewrites them unchanged.
    fn write_block_files(&self, pruned: &BTreeSet<u32>) -> Result<(), NodeError> {
        self.block_files.flush_block_file(false)?;
        let mut records = self.block_files.get_and_clear_dirty_file_info();
        for &file in pruned {
            match records.binary_search_by_key(&file, |(f, _)| *f) {
                Ok(i) => records[i].1 = BlockFileInfo::default(),
                Err(i) => records.insert(i, (file, BlockFileInfo::default())),
            }
        }
        if records.is_empty() {
            return Ok(());
        }

        if let Err(e) = self
            .store
            .write_block_file_info(&records, self.block_files.last_block_file())
        {
            self.block_files
                .mark_dirty(records.iter().map(|(file, _)| *file).filter(|file| !pruned.contains(file)));
            return Err(e.into());
        }
        for &file in pruned {
            self.block_files.clear_file_info(file);
        }
        Ok(())
    }
}

/// Reject blocks spending coins that do not exist, or spending one twice.
fn check_block_inputs(
    cache: &CoinsViewCache<'_>,
    block: &Block,
    genesis_enabled: bool,
) -> Result<(), NodeError> {
    let mut created = HashSet::new();
    let mut spent = HashSet::new();
    for tx in &block.transactions {
        let txid = tx.txid()?;
        if !tx.is_coinbase() {
            for input in &tx.inputs {
                let outpoint = input.prevout;
                let available = created.contains(&outpoint) || cache.have_coin(&outpoint)?;
                if !available || !spent.insert(outpoint) {
                    return Err(NodeError::MissingInputs(txid));
                }
            }
        }
        for (index, out) in tx.outputs.iter().enumerate() {
            if !out.script_pubkey.is_unspendable(genesis_enabled) {
                created.insert(OutPoint::new(txid, index as u32));
            }
        }
    }
    Ok(())
}

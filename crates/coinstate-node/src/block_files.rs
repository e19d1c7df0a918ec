//! Block and undo file space accounting.
//!
//! [`BlockFileInfoStore`] decides which `blk` file each new block goes to,
//! tracks how much of every file is used, triggers chunked pre-allocation
//! and picks files to prune. All state sits behind one mutex.
//!
//! Pruning decisions also need a consistent tip height. Callers pass the
//! active chain as a `parking_lot::Mutex<impl ChainTip>`; the chain lock is
//! always taken before the store's own lock.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::block_file_access::BlockFileAccess;
use crate::config::{BlockStoreConfig, ONE_MEBIBYTE};
use crate::error::{BlockFileError, StorageError};
use crate::storage::BlockTreeDb;

/// Block files grow in steps of this many bytes.
pub const BLOCKFILE_CHUNK_SIZE: u64 = 16 * ONE_MEBIBYTE;

/// Undo files grow in steps of this many bytes.
pub const UNDOFILE_CHUNK_SIZE: u64 = ONE_MEBIBYTE;

/// Location of a block (or its undo data) on disk.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
    bincode::Encode, bincode::Decode,
)]
pub struct DiskBlockPos {
    pub file: u32,
    pub pos: u64,
}

impl DiskBlockPos {
    pub fn new(file: u32, pos: u64) -> Self {
        Self { file, pos }
    }
}

impl fmt::Display for DiskBlockPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file={} pos={}", self.file, self.pos)
    }
}

/// Per-file totals.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockFileInfo {
    blocks: u32,
    size: u64,
    undo_size: u64,
    height_first: u32,
    height_last: u32,
    time_first: u64,
    time_last: u64,
}

impl BlockFileInfo {
    pub fn blocks(&self) -> u32 {
        self.blocks
    }

    /// Bytes of block data in the file.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes of undo data in the companion file.
    pub fn undo_size(&self) -> u64 {
        self.undo_size
    }

    pub fn height_first(&self) -> u32 {
        self.height_first
    }

    pub fn height_last(&self) -> u32 {
        self.height_last
    }

    pub fn time_first(&self) -> u64 {
        self.time_first
    }

    pub fn time_last(&self) -> u64 {
        self.time_last
    }

    fn add_block(&mut self, height: u32, time: u64) {
        if self.blocks == 0 || self.height_first > height {
            self.height_first = height;
        }
        if self.blocks == 0 || self.time_first > time {
            self.time_first = time;
        }
        self.blocks += 1;
        if height > self.height_last {
            self.height_last = height;
        }
        if time > self.time_last {
            self.time_last = time;
        }
    }

    /// Account for a block appended at the end of the file.
    pub fn add_new_block(&mut self, height: u32, time: u64, add_size: u64) {
        self.add_block(height, time);
        self.size += add_size;
    }

    /// Account for a block already stored at `pos`, e.g. while reindexing.
    pub fn add_known_block(&mut self, height: u32, time: u64, add_size: u64, pos: u64) {
        self.add_block(height, time);
        self.size = self.size.max(pos + add_size);
    }

    /// Grow the undo size, returning the new total.
    pub fn add_undo_size(&mut self, add_size: u64) -> u64 {
        self.undo_size += add_size;
        self.undo_size
    }
}

impl fmt::Display for BlockFileInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BlockFileInfo(blocks={}, size={}, heights={}...{}, time={}...{})",
            self.blocks,
            self.size,
            self.height_first,
            self.height_last,
            self.time_first,
            self.time_last
        )
    }
}

/// Result of placing block or undo data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FoundPos {
    pub pos: DiskBlockPos,
    /// A new chunk was allocated while pruning is enabled; the caller should
    /// run a prune pass at its next flush.
    pub check_for_pruning: bool,
}

/// Height of the active chain's tip.
pub trait ChainTip {
    fn tip_height(&self) -> Option<u32>;
}

/// A bare tip height, for callers that track nothing else.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TipHeight(pub Option<u32>);

impl ChainTip for TipHeight {
    fn tip_height(&self) -> Option<u32> {
        self.0
    }
}

#[derive(Debug, Default)]
struct FileInfoState {
    files: Vec<BlockFileInfo>,
    last_block_file: u32,
    dirty: BTreeSet<u32>,
}

impl FileInfoState {
    fn ensure_len(&mut self, len: usize) {
        if self.files.len() < len {
            self.files.resize_with(len, BlockFileInfo::default);
        }
    }

    fn info(&self, file: u32) -> &BlockFileInfo {
        let len = self.files.len();
        self.files
            .get(file as usize)
            .unwrap_or_else(|| panic!("block file {file} beyond tracked files ({len})"))
    }

    fn info_mut(&mut self, file: u32) -> &mut BlockFileInfo {
        let len = self.files.len();
        self.files
            .get_mut(file as usize)
            .unwrap_or_else(|| panic!("block file {file} beyond tracked files ({len})"))
    }

    /// First file from `file` onwards that is empty or still has room for
    /// `add_size` bytes, growing the array as needed.
    fn next_file_with_space(&mut self, config: &BlockStoreConfig, add_size: u64, mut file: u32) -> u32 {
        loop {
            let size = self.info(file).size();
            if size == 0 || size + add_size < config.preferred_block_file_size {
                return file;
            }
            file += 1;
            self.ensure_len(file as usize + 1);
        }
    }

    fn current_usage(&self) -> u64 {
        self.files.iter().map(|f| f.size() + f.undo_size()).sum()
    }
}

/// In-memory registry of block file usage.
pub struct BlockFileInfoStore {
    state: Mutex<FileInfoState>,
    access: Arc<dyn BlockFileAccess>,
}

impl BlockFileInfoStore {
    pub fn new(access: Arc<dyn BlockFileAccess>) -> Self {
        Self {
            state: Mutex::new(FileInfoState::default()),
            access,
        }
    }

    /// Choose where a block of `add_size` bytes goes and account for it.
    ///
    /// With `known` set the block is already on disk at that position
    /// (reindex); only the accounting is updated. Otherwise the block is
    /// appended to the current file, or to the first later file with room.
    /// Moving to a different file flushes the one being left, finalizing it
    /// unless the position was known.
    pub fn find_block_pos(
        &self,
        config: &BlockStoreConfig,
        add_size: u64,
        height: u32,
        time: u64,
        known: Option<DiskBlockPos>,
    ) -> Result<FoundPos, BlockFileError> {
        let mut state = self.state.lock();

        let mut file = known.map_or(state.last_block_file, |pos| pos.file);
        state.ensure_len(file as usize + 1);

        let pos = match known {
            Some(pos) => pos,
            None => {
                file = state.next_file_with_space(config, add_size, file);
                DiskBlockPos::new(file, state.info(file).size())
            }
        };

        if file != state.last_block_file {
            if known.is_none() {
                info!(
                    file = state.last_block_file,
                    info = %state.info(state.last_block_file),
                    "leaving block file"
                );
            }
            self.flush_locked(&state, known.is_none())?;
            state.last_block_file = file;
        }

        let info = state.info_mut(file);
        match known {
            Some(pos) => info.add_known_block(height, time, add_size, pos.pos),
            None => info.add_new_block(height, time, add_size),
        }

        let mut check_for_pruning = false;
        if known.is_none() {
            let old_chunks = pos.pos.div_ceil(BLOCKFILE_CHUNK_SIZE);
            let new_chunks = state.info(file).size().div_ceil(BLOCKFILE_CHUNK_SIZE);
            if new_chunks > old_chunks {
                check_for_pruning = config.prune_mode.is_enabled();
                self.access.pre_allocate_block(new_chunks, pos)?;
            }
        }

        state.dirty.insert(file);
        Ok(FoundPos {
            pos,
            check_for_pruning,
        })
    }

    /// Reserve `add_size` bytes of undo data in the undo file of `file`.
    pub fn find_undo_pos(
        &self,
        config: &BlockStoreConfig,
        file: u32,
        add_size: u64,
    ) -> Result<FoundPos, BlockFileError> {
        let mut state = self.state.lock();

        let pos = DiskBlockPos::new(file, state.info(file).undo_size());
        let new_size = state.info_mut(file).add_undo_size(add_size);
        state.dirty.insert(file);

        let mut check_for_pruning = false;
        let old_chunks = pos.pos.div_ceil(UNDOFILE_CHUNK_SIZE);
        let new_chunks = new_size.div_ceil(UNDOFILE_CHUNK_SIZE);
        if new_chunks > old_chunks {
            check_for_pruning = config.prune_mode.is_enabled();
            self.access.pre_allocate_undo(new_chunks, pos)?;
        }

        Ok(FoundPos {
            pos,
            check_for_pruning,
        })
    }

    /// Flush the current block file, optionally finalizing it.
    pub fn flush_block_file(&self, finalize: bool) -> Result<(), BlockFileError> {
        let state = self.state.lock();
        self.flush_locked(&state, finalize)
    }

    fn flush_locked(&self, state: &FileInfoState, finalize: bool) -> Result<(), BlockFileError> {
        if state.files.is_empty() {
            debug_assert_eq!(state.last_block_file, 0);
            return Ok(());
        }
        let file = state.last_block_file;
        self.access.flush_block_file(file, state.info(file), finalize)
    }

    /// Total bytes of block and undo data across all files.
    pub fn calculate_current_usage(&self) -> u64 {
        self.state.lock().current_usage()
    }

    /// Files that can be deleted to bring usage back under the automatic
    /// prune target.
    ///
    /// Nothing is selected before the tip passes `prune_after_height`, and a
    /// file is never selected while it holds a block within
    /// `min_blocks_to_keep` of the tip. Selection stops once projected usage
    /// plus one block chunk and one undo chunk fits the target. The current
    /// file is never selected.
    pub fn find_files_to_prune<C: ChainTip>(
        &self,
        config: &BlockStoreConfig,
        chain: &Mutex<C>,
        prune_after_height: u32,
    ) -> BTreeSet<u32> {
        let chain = chain.lock();
        let state = self.state.lock();

        let mut to_prune = BTreeSet::new();
        let Some(target) = config.prune_mode.target_bytes() else {
            return to_prune;
        };
        let Some(tip) = chain.tip_height() else {
            return to_prune;
        };
        if target == 0 || tip <= prune_after_height {
            return to_prune;
        }

        let last_prunable = i64::from(tip) - i64::from(config.min_blocks_to_keep);
        let mut usage = state.current_usage();
        // New space is allocated before the next prune check runs.
        let buffer = BLOCKFILE_CHUNK_SIZE + UNDOFILE_CHUNK_SIZE;

        if usage + buffer >= target {
            for file in 0..state.last_block_file {
                let info = state.info(file);
                if info.size() == 0 {
                    continue;
                }
                if usage + buffer < target {
                    break;
                }
                if i64::from(info.height_last()) > last_prunable {
                    continue;
                }
                to_prune.insert(file);
                usage -= info.size() + info.undo_size();
            }
        }

        info!(
            target_mib = target / ONE_MEBIBYTE,
            actual_mib = usage / ONE_MEBIBYTE,
            max_prune_height = last_prunable,
            files = to_prune.len(),
            "prune: selected block files for removal"
        );
        to_prune
    }

    /// Files that can be deleted so that nothing above `manual_height` is
    /// removed, still respecting `min_blocks_to_keep`.
    ///
    /// # Panics
    ///
    /// If pruning is disabled or `manual_height` is zero.
    pub fn find_files_to_prune_manual<C: ChainTip>(
        &self,
        config: &BlockStoreConfig,
        chain: &Mutex<C>,
        manual_height: u32,
    ) -> BTreeSet<u32> {
        assert!(
            config.prune_mode.is_enabled() && manual_height > 0,
            "manual prune requires pruning enabled and a positive height"
        );

        let chain = chain.lock();
        let state = self.state.lock();

        let mut to_prune = BTreeSet::new();
        let Some(tip) = chain.tip_height() else {
            return to_prune;
        };

        let last_prunable = if tip < config.min_blocks_to_keep {
            manual_height
        } else {
            manual_height.min(tip - config.min_blocks_to_keep)
        };
        for file in 0..state.last_block_file {
            let info = state.info(file);
            if info.size() == 0 || info.height_last() > last_prunable {
                continue;
            }
            to_prune.insert(file);
        }

        info!(
            prune_height = last_prunable,
            files = to_prune.len(),
            "prune (manual): selected block files for removal"
        );
        to_prune
    }

    /// Replace the in-memory state with what `db` holds.
    ///
    /// Files past `last_block_file` are picked up as long as the database
    /// has consecutive records for them.
    pub fn load_block_file_info(&self, last_block_file: u32, db: &dyn BlockTreeDb) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.files.clear();
        state.dirty.clear();
        state.last_block_file = last_block_file;
        state.ensure_len(last_block_file as usize + 1);

        for file in 0..=last_block_file {
            if let Some(info) = db.read_block_file_info(file)? {
                state.files[file as usize] = info;
            }
        }
        info!(
            last_block_file,
            info = %state.info(last_block_file),
            "loaded block file info"
        );

        let mut file = last_block_file + 1;
        while let Some(info) = db.read_block_file_info(file)? {
            state.files.push(info);
            file += 1;
        }
        Ok(())
    }

    /// Snapshot of every file changed since the last call, in file order.
    pub fn get_and_clear_dirty_file_info(&self) -> Vec<(u32, BlockFileInfo)> {
        let mut state = self.state.lock();
        let dirty = std::mem::take(&mut state.dirty);
        dirty
            .into_iter()
            .map(|file| (file, state.info(file).clone()))
            .collect()
    }

    /// Mark `files` dirty again, after a failed write of their records.
    pub fn mark_dirty(&self, files: impl IntoIterator<Item = u32>) {
        self.state.lock().dirty.extend(files);
    }

    /// Reset a pruned file's totals and mark it dirty.
    pub fn clear_file_info(&self, file: u32) {
        let mut state = self.state.lock();
        *state.info_mut(file) = BlockFileInfo::default();
        state.dirty.insert(file);
    }

    /// Forget everything, without marking anything dirty.
    pub fn clear(&self) {
        *self.state.lock() = FileInfoState::default();
    }

    /// # Panics
    ///
    /// If `file` is beyond the tracked files.
    pub fn get_block_file_info(&self, file: u32) -> BlockFileInfo {
        self.state.lock().info(file).clone()
    }

    pub fn last_block_file(&self) -> u32 {
        self.state.lock().last_block_file
    }

    /// Number of tracked files.
    pub fn file_count(&self) -> usize {
        self.state.lock().files.len()
    }
}

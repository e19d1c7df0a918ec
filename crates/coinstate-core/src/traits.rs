//! Contracts between cache levels.
//!
//! - [`CoinsView`]: what a cache needs from the level below it
//! - [`CoinsViewWrite`]: how a level receives a child's flushed mutations
//!
//! Implemented by [`EmptyCoinsView`], [`MemoryCoinsView`](crate::memory_view::MemoryCoinsView),
//! [`CoinsViewCache`](crate::coins_cache::CoinsViewCache) and the RocksDB view
//! in `coinstate-node`.

use crate::coin::CoinImpl;
use crate::coins_store::CoinsMap;
use crate::error::CoinsError;
use crate::types::{Hash256, OutPoint, Transaction};

/// Read access to a backing coin set.
pub trait CoinsView {
    /// Look up a coin, loading its script only if it is at most
    /// `max_script_size` bytes.
    ///
    /// The returned coin's ownership tag tells the caller whether it now owns
    /// the script bytes ([`CoinImpl::is_storage_owner`]) or holds a handle to
    /// bytes a lower cache already owns. Spent tombstones may be returned by
    /// cache levels; persistent stores return `None` for spent coins.
    fn get_coin(&self, outpoint: &OutPoint, max_script_size: u64) -> Result<Option<CoinImpl>, CoinsError>;

    /// Hash of the block this view's state corresponds to.
    fn get_best_block(&self) -> Result<Hash256, CoinsError>;

    /// Hint to pre-load every coin the given transactions touch. Best effort.
    fn cache_all_coins(&self, _txs: &[Transaction]) -> Result<(), CoinsError> {
        Ok(())
    }

    /// Whether an unspent coin exists, without paying for its script.
    fn have_coin(&self, outpoint: &OutPoint) -> Result<bool, CoinsError> {
        Ok(self
            .get_coin(outpoint, 0)?
            .is_some_and(|coin| !coin.is_spent()))
    }
}

/// Mutations flushed out of a cache level.
#[derive(Debug, Default)]
pub struct CoinsChanges {
    pub coins: CoinsMap,
    /// Best block of the flushed level, if it ever learned one.
    pub best_block: Option<Hash256>,
}

/// Write access used when a child level is flushed.
pub trait CoinsViewWrite {
    /// Merge `changes` into this level. The map is drained.
    fn batch_write(&mut self, changes: CoinsChanges) -> Result<(), CoinsError>;
}

/// A backing view that holds nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyCoinsView;

impl CoinsView for EmptyCoinsView {
    fn get_coin(&self, _outpoint: &OutPoint, _max_script_size: u64) -> Result<Option<CoinImpl>, CoinsError> {
        Ok(None)
    }

    fn get_best_block(&self) -> Result<Hash256, CoinsError> {
        Ok(Hash256::ZERO)
    }
}

//! In-memory persistent-store stand-in.
//!
//! [`MemoryCoinsView`] behaves like the bottom of the hierarchy: it owns every
//! script it hands out, never returns tombstones, and applies flushed changes
//! by writing unspent coins and deleting spent ones. Suitable for tests and
//! tools; the node uses RocksDB.

use std::collections::HashMap;

use tracing::debug;

use crate::coin::{CoinImpl, CoinWithScript};
use crate::error::CoinsError;
use crate::traits::{CoinsChanges, CoinsView, CoinsViewWrite};
use crate::types::{Hash256, OutPoint};

#[derive(Debug, Default, Clone)]
pub struct MemoryCoinsView {
    coins: HashMap<OutPoint, CoinWithScript>,
    best_block: Hash256,
}

impl MemoryCoinsView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, outpoint: OutPoint, coin: CoinWithScript) {
        self.coins.insert(outpoint, coin);
    }

    pub fn set_best_block(&mut self, hash: Hash256) {
        self.best_block = hash;
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&CoinWithScript> {
        self.coins.get(outpoint)
    }

    pub fn len(&self) -> usize {
        self.coins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coins.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OutPoint, &CoinWithScript)> {
        self.coins.iter()
    }
}

impl CoinsView for MemoryCoinsView {
    fn get_coin(&self, outpoint: &OutPoint, max_script_size: u64) -> Result<Option<CoinImpl>, CoinsError> {
        let Some(coin) = self.coins.get(outpoint) else {
            return Ok(None);
        };
        let full = CoinImpl::from_coin_with_script(coin.clone());
        if coin.script_size() as u64 <= max_script_size {
            Ok(Some(full))
        } else {
            Ok(Some(full.to_shell()))
        }
    }

    fn get_best_block(&self) -> Result<Hash256, CoinsError> {
        Ok(self.best_block)
    }
}

impl CoinsViewWrite for MemoryCoinsView {
    fn batch_write(&mut self, mut changes: CoinsChanges) -> Result<(), CoinsError> {
        let mut written = 0usize;
        let mut deleted = 0usize;
        for (outpoint, entry) in changes.coins.drain() {
            if !entry.is_dirty() {
                continue;
            }
            if entry.coin.is_spent() {
                self.coins.remove(&outpoint);
                deleted += 1;
                continue;
            }
            let coin = entry.coin.make_owning().ok_or_else(|| {
                CoinsError::Backend(format!("dirty coin without script: {outpoint}"))
            })?;
            self.coins.insert(outpoint, coin);
            written += 1;
        }
        if let Some(best_block) = changes.best_block {
            self.best_block = best_block;
        }
        debug!(written, deleted, "memory view batch write");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coins_store::{CoinsCacheEntry, CoinsMap, EntryFlags};
    use crate::types::{Script, TxOut};

    fn op(n: u8) -> OutPoint {
        OutPoint::new(Hash256([n; 32]), 0)
    }

    fn coin(value: u64) -> CoinWithScript {
        CoinWithScript::new(TxOut::new(value, Script::new(vec![0x51, 0x52])), 1, false, false)
    }

    #[test]
    fn script_loaded_only_within_limit() {
        let mut view = MemoryCoinsView::new();
        view.insert(op(1), coin(10));
        let shell = view.get_coin(&op(1), 0).unwrap().unwrap();
        assert!(!shell.has_script());
        assert!(shell.is_storage_owner());
        let full = view.get_coin(&op(1), 2).unwrap().unwrap();
        assert!(full.has_script());
        assert!(full.is_storage_owner());
    }

    #[test]
    fn batch_write_applies_dirty_entries() {
        let mut view = MemoryCoinsView::new();
        view.insert(op(1), coin(10));
        let mut coins = CoinsMap::new();
        coins.insert(op(1), CoinsCacheEntry::new(CoinImpl::spent(), EntryFlags::DIRTY));
        coins.insert(
            op(2),
            CoinsCacheEntry::new(CoinImpl::from_coin_with_script(coin(20)), EntryFlags::DIRTY),
        );
        coins.insert(
            op(3),
            CoinsCacheEntry::new(CoinImpl::from_coin_with_script(coin(30)), EntryFlags::empty()),
        );
        view.batch_write(CoinsChanges {
            coins,
            best_block: Some(Hash256([7; 32])),
        })
        .unwrap();
        assert!(view.get(&op(1)).is_none());
        assert_eq!(view.get(&op(2)).map(|c| c.value()), Some(20));
        assert!(view.get(&op(3)).is_none());
        assert_eq!(view.get_best_block().unwrap(), Hash256([7; 32]));
    }

    #[test]
    fn batch_write_rejects_dirty_shell() {
        let mut view = MemoryCoinsView::new();
        let mut coins = CoinsMap::new();
        coins.insert(
            op(1),
            CoinsCacheEntry::new(CoinImpl::shell(1, 4, 1, false, false), EntryFlags::DIRTY),
        );
        let err = view
            .batch_write(CoinsChanges { coins, best_block: None })
            .unwrap_err();
        assert!(matches!(err, CoinsError::Backend(_)));
    }
}

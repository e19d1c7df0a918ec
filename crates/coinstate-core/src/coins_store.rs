//! One level of the coin cache hierarchy.
//!
//! [`CoinsStore`] maps outpoints to [`CoinsCacheEntry`] values, each tagged
//! with two independent bits:
//!
//! - `DIRTY`: the entry differs from the parent level and must be written
//!   through on flush.
//! - `FRESH`: the parent level has no entry at all for this outpoint, not
//!   even a spent tombstone, so a spent FRESH entry can be dropped instead
//!   of flushed.
//!
//! FRESH must never be set while the parent holds an unspent record for the
//! outpoint; [`CoinsStore::batch_write`] rejects a child that claims
//! otherwise.
//!
//! Memory use is tracked incrementally on every insert, update and erase, so
//! [`CoinsStore::dynamic_memory_usage`] is O(1).

use std::collections::HashMap;

use bitflags::bitflags;
use tracing::debug;

use crate::coin::{CoinImpl, CoinWithScript};
use crate::error::CoinsError;
use crate::memusage;
use crate::types::OutPoint;

bitflags! {
    /// Mutation state of a cache entry relative to its parent level.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct EntryFlags: u8 {
        const DIRTY = 1 << 0;
        const FRESH = 1 << 1;
    }
}

/// A cached coin together with its mutation flags.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoinsCacheEntry {
    pub coin: CoinImpl,
    pub flags: EntryFlags,
}

impl CoinsCacheEntry {
    pub fn new(coin: CoinImpl, flags: EntryFlags) -> Self {
        Self { coin, flags }
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(EntryFlags::DIRTY)
    }

    pub fn is_fresh(&self) -> bool {
        self.flags.contains(EntryFlags::FRESH)
    }

    /// Heap bytes this entry is accountable for.
    pub fn dynamic_memory_usage(&self) -> usize {
        self.coin.owned_script_bytes()
    }
}

pub type CoinsMap = HashMap<OutPoint, CoinsCacheEntry>;

/// In-memory coin map with DIRTY/FRESH bookkeeping.
#[derive(Debug, Default)]
pub struct CoinsStore {
    cache_coins: CoinsMap,
    cached_coins_usage: usize,
}

impl CoinsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.cache_coins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache_coins.is_empty()
    }

    /// Running total of per-entry usage, without map overhead.
    pub fn cached_coins_usage(&self) -> usize {
        self.cached_coins_usage
    }

    pub fn dynamic_memory_usage(&self) -> usize {
        memusage::hash_map_usage(&self.cache_coins) + self.cached_coins_usage
    }

    pub fn get_entry(&self, outpoint: &OutPoint) -> Option<&CoinsCacheEntry> {
        self.cache_coins.get(outpoint)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&OutPoint, &CoinsCacheEntry)> {
        self.cache_coins.iter()
    }

    /// Local lookup only. Scripted entries come back as non-owning handles,
    /// shells and tombstones as copies.
    pub fn fetch_coin(&self, outpoint: &OutPoint) -> Option<CoinImpl> {
        let entry = self.cache_coins.get(outpoint)?;
        if entry.coin.has_script() {
            Some(entry.coin.make_non_owning())
        } else {
            Some(entry.coin.clone())
        }
    }

    /// Record a coin pulled from the parent level. The entry starts clean;
    /// a spent coin from the parent is FRESH since the parent only holds a
    /// tombstone for it.
    pub fn add_fetched(&mut self, outpoint: OutPoint, coin: CoinImpl) {
        let flags = if coin.is_spent() {
            EntryFlags::FRESH
        } else {
            EntryFlags::empty()
        };
        let entry = CoinsCacheEntry::new(coin, flags);
        self.cached_coins_usage += entry.dynamic_memory_usage();
        let previous = self.cache_coins.insert(outpoint, entry);
        debug_assert!(previous.is_none(), "fetched coin already cached: {outpoint}");
        if let Some(previous) = previous {
            self.cached_coins_usage -= previous.dynamic_memory_usage();
        }
    }

    /// Create or replace the coin at `outpoint`, marking it DIRTY.
    ///
    /// Without `possible_overwrite`, an existing unspent entry is a logic
    /// error. In that mode the new entry is also FRESH when the prior local
    /// state (absent or a tombstone) was not DIRTY.
    pub fn add_coin(
        &mut self,
        outpoint: OutPoint,
        coin: CoinWithScript,
        possible_overwrite: bool,
    ) -> Result<(), CoinsError> {
        let (prior_flags, prior_spent, prior_usage) = match self.cache_coins.get(&outpoint) {
            Some(entry) => (entry.flags, entry.coin.is_spent(), entry.dynamic_memory_usage()),
            None => (EntryFlags::empty(), true, 0),
        };

        let mut fresh = false;
        if !possible_overwrite {
            if !prior_spent {
                return Err(CoinsError::OverwriteUnspent(outpoint));
            }
            fresh = !prior_flags.contains(EntryFlags::DIRTY);
        }

        let mut flags = prior_flags | EntryFlags::DIRTY;
        if fresh {
            flags |= EntryFlags::FRESH;
        }
        let entry = CoinsCacheEntry::new(CoinImpl::from_coin_with_script(coin), flags);
        self.cached_coins_usage -= prior_usage;
        self.cached_coins_usage += entry.dynamic_memory_usage();
        self.cache_coins.insert(outpoint, entry);
        Ok(())
    }

    /// Spend the local entry. FRESH entries vanish outright; others become
    /// DIRTY tombstones. Returns false when there is no local entry.
    pub fn spend_coin(&mut self, outpoint: &OutPoint) -> bool {
        let Some(entry) = self.cache_coins.get_mut(outpoint) else {
            return false;
        };
        self.cached_coins_usage -= entry.dynamic_memory_usage();
        if entry.is_fresh() {
            self.cache_coins.remove(outpoint);
        } else {
            entry.flags |= EntryFlags::DIRTY;
            entry.coin.clear();
        }
        true
    }

    /// Insert a child's entry for an outpoint this level does not hold.
    /// FRESH survives only if the child had it; DIRTY is always set.
    pub fn add_entry(&mut self, outpoint: OutPoint, entry: CoinsCacheEntry) {
        let mut flags = EntryFlags::DIRTY;
        if entry.is_fresh() {
            flags |= EntryFlags::FRESH;
        }
        let entry = CoinsCacheEntry::new(entry.coin, flags);
        self.cached_coins_usage += entry.dynamic_memory_usage();
        if let Some(previous) = self.cache_coins.insert(outpoint, entry) {
            self.cached_coins_usage -= previous.dynamic_memory_usage();
        }
    }

    /// Replace the coin of an existing entry, keeping this level's flags.
    ///
    /// The child's FRESH flag is deliberately not copied: our entry may be a
    /// tombstone the grandparent still needs to see.
    pub fn update_entry(&mut self, outpoint: &OutPoint, entry: CoinsCacheEntry) {
        let Some(ours) = self.cache_coins.get_mut(outpoint) else {
            return;
        };
        self.cached_coins_usage -= ours.dynamic_memory_usage();
        ours.coin = entry.coin;
        ours.flags |= EntryFlags::DIRTY;
        self.cached_coins_usage += ours.dynamic_memory_usage();
    }

    pub fn erase_coin(&mut self, outpoint: &OutPoint) {
        if let Some(entry) = self.cache_coins.remove(outpoint) {
            self.cached_coins_usage -= entry.dynamic_memory_usage();
        }
    }

    /// Drop clean entries for the given outpoints. Has no effect on
    /// correctness, only on memory.
    pub fn uncache(&mut self, outpoints: &[OutPoint]) {
        for outpoint in outpoints {
            if self
                .cache_coins
                .get(outpoint)
                .is_some_and(|entry| entry.flags.is_empty())
            {
                self.erase_coin(outpoint);
            }
        }
    }

    /// Merge a child level's mutations into this level, draining `child`.
    ///
    /// Non-dirty child entries are discarded. A FRESH child entry meeting an
    /// unspent entry here is a logic error; entries already merged stay
    /// merged and the remainder of `child` is dropped.
    pub fn batch_write(&mut self, child: &mut CoinsMap) -> Result<(), CoinsError> {
        let mut merged = 0usize;
        let mut erased = 0usize;

        for (outpoint, entry) in child.drain() {
            if !entry.is_dirty() {
                continue;
            }

            let ours = self
                .cache_coins
                .get(&outpoint)
                .map(|ours| (ours.is_fresh(), ours.coin.is_spent()));

            match ours {
                None => {
                    // FRESH and spent in the child: nothing to tell anyone.
                    if !(entry.is_fresh() && entry.coin.is_spent()) {
                        self.add_entry(outpoint, entry);
                        merged += 1;
                    }
                }
                Some((our_fresh, our_spent)) => {
                    if entry.is_fresh() && !our_spent {
                        return Err(CoinsError::FreshMisapplied(outpoint));
                    }
                    if our_fresh && entry.coin.is_spent() {
                        // The grandparent never saw this coin either.
                        self.erase_coin(&outpoint);
                        erased += 1;
                    } else {
                        self.update_entry(&outpoint, entry);
                        merged += 1;
                    }
                }
            }
        }

        debug!(merged, erased, entries = self.cache_coins.len(), "coins batch write");
        Ok(())
    }

    /// Insert a child's entries without merge checks, draining `child`.
    ///
    /// The caller guarantees the key sets are disjoint; debug builds verify it.
    pub fn batch_write_unchecked(&mut self, child: &mut CoinsMap) {
        debug_assert!(
            child.keys().all(|outpoint| !self.cache_coins.contains_key(outpoint)),
            "unchecked batch write with overlapping outpoints"
        );
        self.cache_coins.reserve(child.len());
        for (outpoint, entry) in child.drain() {
            self.cached_coins_usage += entry.dynamic_memory_usage();
            if let Some(previous) = self.cache_coins.insert(outpoint, entry) {
                self.cached_coins_usage -= previous.dynamic_memory_usage();
            }
        }
    }

    /// Move every entry out, leaving this level empty.
    pub fn take_map(&mut self) -> CoinsMap {
        self.cached_coins_usage = 0;
        std::mem::take(&mut self.cache_coins)
    }

    pub fn clear(&mut self) {
        self.cache_coins.clear();
        self.cached_coins_usage = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Hash256, Script, TxOut};
    use proptest::prelude::*;

    fn op(n: u8) -> OutPoint {
        OutPoint::new(Hash256([n; 32]), 0)
    }

    fn coin(value: u64, script_len: usize) -> CoinWithScript {
        CoinWithScript::new(TxOut::new(value, Script::new(vec![0x51; script_len])), 10, false, false)
    }

    fn flags_of(store: &CoinsStore, outpoint: &OutPoint) -> Option<EntryFlags> {
        store.get_entry(outpoint).map(|entry| entry.flags)
    }

    fn sum_of_entries(store: &CoinsStore) -> usize {
        store.entries().map(|(_, entry)| entry.dynamic_memory_usage()).sum()
    }

    #[test]
    fn add_to_empty_is_dirty_and_fresh() {
        let mut store = CoinsStore::new();
        store.add_coin(op(1), coin(5_000, 4), false).unwrap();
        assert_eq!(flags_of(&store, &op(1)), Some(EntryFlags::DIRTY | EntryFlags::FRESH));
    }

    #[test]
    fn add_with_overwrite_is_dirty_only() {
        let mut store = CoinsStore::new();
        store.add_coin(op(1), coin(5_000, 4), true).unwrap();
        assert_eq!(flags_of(&store, &op(1)), Some(EntryFlags::DIRTY));
    }

    #[test]
    fn add_over_unspent_without_permission_fails() {
        let mut store = CoinsStore::new();
        store.add_coin(op(1), coin(5_000, 4), false).unwrap();
        let err = store.add_coin(op(1), coin(6_000, 4), false).unwrap_err();
        assert_eq!(err, CoinsError::OverwriteUnspent(op(1)));
        assert!(err.is_logic_error());
        // Original coin untouched.
        assert_eq!(store.fetch_coin(&op(1)).unwrap().value(), 5_000);
    }

    #[test]
    fn add_over_unspent_with_permission_replaces() {
        let mut store = CoinsStore::new();
        store.add_coin(op(1), coin(5_000, 4), false).unwrap();
        store.add_coin(op(1), coin(6_000, 8), true).unwrap();
        assert_eq!(store.fetch_coin(&op(1)).unwrap().value(), 6_000);
        assert_eq!(store.cached_coins_usage(), 8);
    }

    #[test]
    fn add_over_dirty_tombstone_is_not_fresh() {
        let mut store = CoinsStore::new();
        store.add_fetched(op(1), CoinImpl::from_coin_with_script(coin(5_000, 4)));
        assert!(store.spend_coin(&op(1)));
        assert_eq!(flags_of(&store, &op(1)), Some(EntryFlags::DIRTY));
        store.add_coin(op(1), coin(7_000, 4), false).unwrap();
        assert_eq!(flags_of(&store, &op(1)), Some(EntryFlags::DIRTY));
    }

    #[test]
    fn add_over_clean_tombstone_is_fresh() {
        let mut store = CoinsStore::new();
        store.add_fetched(op(1), CoinImpl::spent());
        assert_eq!(flags_of(&store, &op(1)), Some(EntryFlags::FRESH));
        store.add_coin(op(1), coin(7_000, 4), false).unwrap();
        assert_eq!(flags_of(&store, &op(1)), Some(EntryFlags::DIRTY | EntryFlags::FRESH));
    }

    #[test]
    fn spend_fresh_entry_erases_it() {
        let mut store = CoinsStore::new();
        store.add_coin(op(1), coin(5_000, 4), false).unwrap();
        assert!(store.spend_coin(&op(1)));
        assert!(store.get_entry(&op(1)).is_none());
        assert_eq!(store.cached_coins_usage(), 0);
    }

    #[test]
    fn spend_non_fresh_entry_leaves_dirty_tombstone() {
        let mut store = CoinsStore::new();
        store.add_fetched(op(1), CoinImpl::from_coin_with_script(coin(5_000, 4)));
        assert!(store.spend_coin(&op(1)));
        let entry = store.get_entry(&op(1)).unwrap();
        assert!(entry.coin.is_spent());
        assert!(entry.is_dirty());
        assert!(!entry.is_fresh());
    }

    #[test]
    fn spend_missing_returns_false() {
        let mut store = CoinsStore::new();
        assert!(!store.spend_coin(&op(9)));
    }

    #[test]
    fn fetch_scripted_entry_returns_handle() {
        let mut store = CoinsStore::new();
        store.add_coin(op(1), coin(5_000, 4), false).unwrap();
        let fetched = store.fetch_coin(&op(1)).unwrap();
        assert!(fetched.has_script());
        assert!(!fetched.is_storage_owner());
    }

    #[test]
    fn fetch_shell_returns_shell() {
        let mut store = CoinsStore::new();
        store.add_fetched(op(1), CoinImpl::shell(5_000, 25, 3, true, false));
        let fetched = store.fetch_coin(&op(1)).unwrap();
        assert!(!fetched.has_script());
        assert!(fetched.is_storage_owner());
        assert_eq!(fetched.script_size(), 25);
    }

    #[test]
    fn uncache_only_drops_clean_entries() {
        let mut store = CoinsStore::new();
        store.add_fetched(op(1), CoinImpl::shell(1, 1, 1, false, false));
        store.add_coin(op(2), coin(2, 2), false).unwrap();
        store.add_fetched(op(3), CoinImpl::spent());
        store.uncache(&[op(1), op(2), op(3), op(4)]);
        assert!(store.get_entry(&op(1)).is_none());
        assert!(store.get_entry(&op(2)).is_some());
        // FRESH tombstone is not clean.
        assert!(store.get_entry(&op(3)).is_some());
    }

    #[test]
    fn batch_write_skips_fresh_spent_and_clean() {
        let mut parent = CoinsStore::new();
        let mut child = CoinsMap::new();
        child.insert(
            op(1),
            CoinsCacheEntry::new(CoinImpl::spent(), EntryFlags::DIRTY | EntryFlags::FRESH),
        );
        child.insert(
            op(2),
            CoinsCacheEntry::new(CoinImpl::from_coin_with_script(coin(1, 1)), EntryFlags::empty()),
        );
        parent.batch_write(&mut child).unwrap();
        assert!(child.is_empty());
        assert!(parent.is_empty());
    }

    #[test]
    fn batch_write_inserts_absent_with_fresh_preserved() {
        let mut parent = CoinsStore::new();
        let mut child = CoinsMap::new();
        child.insert(
            op(1),
            CoinsCacheEntry::new(
                CoinImpl::from_coin_with_script(coin(5, 3)),
                EntryFlags::DIRTY | EntryFlags::FRESH,
            ),
        );
        child.insert(
            op(2),
            CoinsCacheEntry::new(CoinImpl::spent(), EntryFlags::DIRTY),
        );
        parent.batch_write(&mut child).unwrap();
        assert_eq!(flags_of(&parent, &op(1)), Some(EntryFlags::DIRTY | EntryFlags::FRESH));
        assert_eq!(flags_of(&parent, &op(2)), Some(EntryFlags::DIRTY));
        assert_eq!(parent.cached_coins_usage(), 3);
    }

    #[test]
    fn batch_write_rejects_fresh_over_unspent() {
        let mut parent = CoinsStore::new();
        parent.add_fetched(op(1), CoinImpl::from_coin_with_script(coin(5, 3)));
        let mut child = CoinsMap::new();
        child.insert(
            op(1),
            CoinsCacheEntry::new(
                CoinImpl::from_coin_with_script(coin(6, 3)),
                EntryFlags::DIRTY | EntryFlags::FRESH,
            ),
        );
        assert_eq!(
            parent.batch_write(&mut child),
            Err(CoinsError::FreshMisapplied(op(1)))
        );
    }

    #[test]
    fn batch_write_erases_parent_fresh_when_child_spent() {
        let mut parent = CoinsStore::new();
        parent.add_coin(op(1), coin(5, 3), false).unwrap();
        let mut child = CoinsMap::new();
        child.insert(op(1), CoinsCacheEntry::new(CoinImpl::spent(), EntryFlags::DIRTY));
        parent.batch_write(&mut child).unwrap();
        assert!(parent.get_entry(&op(1)).is_none());
        assert_eq!(parent.cached_coins_usage(), 0);
    }

    #[test]
    fn batch_write_update_keeps_parent_flags() {
        let mut parent = CoinsStore::new();
        parent.add_fetched(op(1), CoinImpl::from_coin_with_script(coin(5, 3)));
        let mut child = CoinsMap::new();
        child.insert(op(1), CoinsCacheEntry::new(CoinImpl::spent(), EntryFlags::DIRTY));
        parent.batch_write(&mut child).unwrap();
        let entry = parent.get_entry(&op(1)).unwrap();
        assert!(entry.coin.is_spent());
        assert_eq!(entry.flags, EntryFlags::DIRTY);
    }

    #[test]
    fn batch_write_fresh_child_over_parent_tombstone_does_not_copy_fresh() {
        let mut parent = CoinsStore::new();
        parent.add_fetched(op(1), CoinImpl::from_coin_with_script(coin(5, 3)));
        parent.spend_coin(&op(1));
        let mut child = CoinsMap::new();
        child.insert(
            op(1),
            CoinsCacheEntry::new(
                CoinImpl::from_coin_with_script(coin(9, 2)),
                EntryFlags::DIRTY | EntryFlags::FRESH,
            ),
        );
        parent.batch_write(&mut child).unwrap();
        let entry = parent.get_entry(&op(1)).unwrap();
        assert_eq!(entry.coin.value(), 9);
        assert_eq!(entry.flags, EntryFlags::DIRTY);
    }

    #[test]
    fn batch_write_unchecked_moves_everything() {
        let mut parent = CoinsStore::new();
        let mut child = CoinsMap::new();
        child.insert(
            op(1),
            CoinsCacheEntry::new(CoinImpl::from_coin_with_script(coin(5, 7)), EntryFlags::empty()),
        );
        child.insert(op(2), CoinsCacheEntry::new(CoinImpl::spent(), EntryFlags::FRESH));
        parent.batch_write_unchecked(&mut child);
        assert!(child.is_empty());
        assert_eq!(parent.len(), 2);
        assert_eq!(parent.cached_coins_usage(), 7);
    }

    #[test]
    fn usage_matches_entries_after_mixed_operations() {
        let mut store = CoinsStore::new();
        for n in 0..20u8 {
            store.add_coin(op(n), coin(n as u64, n as usize), false).unwrap();
        }
        for n in (0..20u8).step_by(3) {
            store.spend_coin(&op(n));
        }
        store.add_coin(op(1), coin(1, 100), true).unwrap();
        store.erase_coin(&op(2));
        assert_eq!(store.cached_coins_usage(), sum_of_entries(&store));
        assert!(store.dynamic_memory_usage() >= store.cached_coins_usage());
    }

    #[test]
    fn take_map_resets_usage() {
        let mut store = CoinsStore::new();
        store.add_coin(op(1), coin(5, 3), false).unwrap();
        let map = store.take_map();
        assert_eq!(map.len(), 1);
        assert!(store.is_empty());
        assert_eq!(store.cached_coins_usage(), 0);
    }

    // --- proptest ---

    proptest! {
        #[test]
        fn no_fresh_tombstones_survive(ops in prop::collection::vec((any::<bool>(), 0u8..8, 0usize..40), 0..64)) {
            let mut store = CoinsStore::new();
            for (add, n, len) in ops {
                if add {
                    let unspent = store.get_entry(&op(n)).is_some_and(|e| !e.coin.is_spent());
                    store.add_coin(op(n), coin(1, len), unspent).unwrap();
                } else {
                    store.spend_coin(&op(n));
                }
            }
            for (outpoint, entry) in store.entries() {
                prop_assert!(entry.is_dirty(), "{:?} not dirty", outpoint);
                prop_assert!(!(entry.is_fresh() && entry.coin.is_spent()), "{:?} fresh tombstone", outpoint);
            }
            prop_assert_eq!(store.cached_coins_usage(), sum_of_entries(&store));
        }
    }
}

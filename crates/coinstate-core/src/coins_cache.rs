//! Validation-facing coin cache.
//!
//! A [`CoinsViewCache`] layers a [`CoinsStore`] over a backing [`CoinsView`]
//! (the persistent store or another cache). Lookups fall through to the
//! backing view on a miss and remember the answer locally; mutations only
//! touch the local store until the cache is flushed with
//! [`CoinsViewCache::into_changes`] into the parent's
//! [`CoinsViewWrite::batch_write`].
//!
//! Every cache has exactly one [`Shard`]. The type is neither `Send` nor
//! `Sync`: a cache belongs to the thread that built it, and the compiler
//! enforces that.
//!
//! ```compile_fail
//! fn assert_send<T: Send>() {}
//! assert_send::<coinstate_core::coins_cache::CoinsViewCache<'static>>();
//! ```

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;

use tracing::debug;

use crate::coin::{Coin, CoinImpl, CoinWithScript};
use crate::coins_store::CoinsStore;
use crate::error::CoinsError;
use crate::traits::{CoinsChanges, CoinsView, CoinsViewWrite};
use crate::types::{Hash256, OutPoint, Transaction};

/// One partition of a cache: a local store plus its backing view.
struct Shard<'a> {
    view: &'a dyn CoinsView,
    cache: RefCell<CoinsStore>,
    best_block: Cell<Option<Hash256>>,
}

impl<'a> Shard<'a> {
    fn new(view: &'a dyn CoinsView) -> Self {
        Self {
            view,
            cache: RefCell::new(CoinsStore::new()),
            best_block: Cell::new(None),
        }
    }

    /// Resolve a coin, falling through to the backing view when the local
    /// copy is missing, or is a shell and the script is required.
    fn get_coin(&self, outpoint: &OutPoint, requires_script: bool) -> Result<Option<CoinImpl>, CoinsError> {
        let cached = self.cache.borrow().fetch_coin(outpoint);
        if let Some(coin) = &cached {
            if coin.is_spent() || coin.has_script() || !requires_script {
                return Ok(cached);
            }
        }

        let max_script_size = if requires_script { u64::MAX } else { 0 };
        let from_view = self.view.get_coin(outpoint, max_script_size)?;
        if let (Some(coin), None) = (&from_view, &cached) {
            // A storage-owning answer means nobody below keeps the script in
            // memory, so this level keeps only the shell. Otherwise keep a
            // handle to the lower level's bytes.
            let local = if coin.is_storage_owner() {
                coin.to_shell()
            } else {
                coin.make_non_owning()
            };
            self.cache.borrow_mut().add_fetched(*outpoint, local);
        }
        Ok(from_view)
    }

    fn best_block(&self) -> Result<Hash256, CoinsError> {
        if let Some(hash) = self.best_block.get() {
            return Ok(hash);
        }
        let hash = self.view.get_best_block()?;
        self.best_block.set(Some(hash));
        Ok(hash)
    }
}

/// Single-threaded, copy-on-write view of the coin set.
pub struct CoinsViewCache<'a> {
    shard: Shard<'a>,
    _owner_thread: PhantomData<*const ()>,
}

impl<'a> CoinsViewCache<'a> {
    pub fn new(view: &'a dyn CoinsView) -> Self {
        Self {
            shard: Shard::new(view),
            _owner_thread: PhantomData,
        }
    }

    /// Coin without its script. Spent tombstones known to this level are
    /// returned as spent coins.
    pub fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError> {
        Ok(self
            .shard
            .get_coin(outpoint, false)?
            .map(|coin| coin.to_coin()))
    }

    /// Coin with its script, loading the script if needed.
    pub fn get_coin_with_script(&self, outpoint: &OutPoint) -> Result<Option<CoinWithScript>, CoinsError> {
        let Some(coin) = self.shard.get_coin(outpoint, true)? else {
            return Ok(None);
        };
        debug_assert!(
            coin.is_spent() || coin.has_script(),
            "backing view returned a shell for a scripted lookup of {outpoint}"
        );
        Ok(coin.make_owning())
    }

    pub fn have_coin(&self, outpoint: &OutPoint) -> Result<bool, CoinsError> {
        Ok(self
            .shard
            .get_coin(outpoint, false)?
            .is_some_and(|coin| !coin.is_spent()))
    }

    /// Add a new coin.
    ///
    /// Outputs that can provably never be spent are not stored at all. The
    /// caller must have looked the outpoint up first so that any existing
    /// coin below this level is visible to the overwrite check.
    pub fn add_coin(
        &mut self,
        outpoint: OutPoint,
        coin: CoinWithScript,
        possible_overwrite: bool,
        genesis_activation_height: u32,
    ) -> Result<(), CoinsError> {
        debug_assert!(!coin.is_spent(), "adding a spent coin at {outpoint}");
        let genesis_enabled = coin.height() >= genesis_activation_height;
        if coin.tx_out().script_pubkey.is_unspendable(genesis_enabled) {
            return Ok(());
        }

        if cfg!(debug_assertions)
            && !possible_overwrite
            && self.shard.cache.borrow().fetch_coin(&outpoint).is_none()
        {
            let below = self.shard.view.get_coin(&outpoint, 0)?;
            debug_assert!(
                below.is_none_or(|c| c.is_spent()),
                "coin {outpoint} exists below the cache but was not loaded before adding"
            );
        }

        self.shard
            .cache
            .get_mut()
            .add_coin(outpoint, coin, possible_overwrite)
    }

    /// Spend a coin. Returns false when no level knows the outpoint.
    pub fn spend_coin(&mut self, outpoint: &OutPoint) -> Result<bool, CoinsError> {
        if self.shard.get_coin(outpoint, false)?.is_none() {
            return Ok(false);
        }
        Ok(self.shard.cache.get_mut().spend_coin(outpoint))
    }

    /// Spend a coin and hand back its full pre-spend contents, as needed for
    /// undo data.
    pub fn spend_coin_take(&mut self, outpoint: &OutPoint) -> Result<Option<CoinWithScript>, CoinsError> {
        let Some(coin) = self.shard.get_coin(outpoint, true)? else {
            return Ok(None);
        };
        let owned = coin.make_owning();
        if !self.shard.cache.get_mut().spend_coin(outpoint) {
            return Ok(None);
        }
        Ok(owned)
    }

    /// Sum of the values of every input of `tx`.
    ///
    /// # Panics
    ///
    /// If an input's coin is missing or spent. Inputs must have been checked
    /// with [`have_inputs`](Self::have_inputs) first.
    ///
    /// Fails with [`CoinsError::ValueOverflow`] if the input values do not
    /// fit in a `u64`.
    pub fn get_value_in(&self, tx: &Transaction) -> Result<u64, CoinsError> {
        if tx.is_coinbase() {
            return Ok(0);
        }
        let mut total = 0u64;
        for input in &tx.inputs {
            let coin = self.get_coin(&input.prevout)?;
            let coin = match coin {
                Some(coin) if !coin.is_spent() => coin,
                _ => panic!("get_value_in: input {} is not an unspent coin", input.prevout),
            };
            total = total
                .checked_add(coin.value())
                .ok_or(CoinsError::ValueOverflow)?;
        }
        Ok(total)
    }

    /// Whether every input of a non-coinbase transaction resolves to an
    /// unspent coin.
    pub fn have_inputs(&self, tx: &Transaction) -> Result<bool, CoinsError> {
        if tx.is_coinbase() {
            return Ok(true);
        }
        for input in &tx.inputs {
            if !self.have_coin(&input.prevout)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Like [`have_inputs`](Self::have_inputs), but gives up with `None` once
    /// the combined script size of the inputs seen so far reaches
    /// `max_cached_coins_usage` bytes. A budget of zero is unlimited.
    pub fn have_inputs_limited(
        &self,
        tx: &Transaction,
        max_cached_coins_usage: usize,
    ) -> Result<Option<bool>, CoinsError> {
        if tx.is_coinbase() {
            return Ok(Some(true));
        }
        let mut script_bytes = 0usize;
        for input in &tx.inputs {
            match self.shard.get_coin(&input.prevout, false)? {
                Some(coin) if !coin.is_spent() => script_bytes += coin.script_size(),
                _ => return Ok(Some(false)),
            }
            if max_cached_coins_usage > 0 && script_bytes >= max_cached_coins_usage {
                return Ok(None);
            }
        }
        Ok(Some(true))
    }

    /// Ask the backing view to pre-load every coin the transactions touch.
    pub fn cache_inputs(&self, txs: &[Transaction]) -> Result<(), CoinsError> {
        self.shard.view.cache_all_coins(txs)
    }

    /// Best block of this view, pulled from the backing view on first use.
    pub fn get_best_block(&self) -> Result<Hash256, CoinsError> {
        self.shard.best_block()
    }

    pub fn set_best_block(&mut self, hash: Hash256) {
        self.shard.best_block.set(Some(hash));
    }

    pub fn dynamic_memory_usage(&self) -> usize {
        self.shard.cache.borrow().dynamic_memory_usage()
    }

    /// Number of entries held at this level.
    pub fn cache_size(&self) -> usize {
        self.shard.cache.borrow().len()
    }

    /// Drop clean local entries for the given outpoints.
    pub fn uncache(&mut self, outpoints: &[OutPoint]) {
        self.shard.cache.get_mut().uncache(outpoints);
    }

    /// Read access to the local store, e.g. to inspect entry flags.
    pub fn with_store<R>(&self, f: impl FnOnce(&CoinsStore) -> R) -> R {
        f(&self.shard.cache.borrow())
    }

    /// Consume the cache, handing its mutations to whoever flushes them.
    pub fn into_changes(self) -> CoinsChanges {
        let best_block = self.shard.best_block.get();
        let coins = self.shard.cache.into_inner().take_map();
        debug!(entries = coins.len(), "flushing coins cache");
        CoinsChanges { coins, best_block }
    }
}

impl CoinsView for CoinsViewCache<'_> {
    fn get_coin(&self, outpoint: &OutPoint, max_script_size: u64) -> Result<Option<CoinImpl>, CoinsError> {
        self.shard.get_coin(outpoint, max_script_size > 0)
    }

    fn get_best_block(&self) -> Result<Hash256, CoinsError> {
        self.shard.best_block()
    }

    fn cache_all_coins(&self, txs: &[Transaction]) -> Result<(), CoinsError> {
        self.cache_inputs(txs)
    }
}

impl CoinsViewWrite for CoinsViewCache<'_> {
    fn batch_write(&mut self, mut changes: CoinsChanges) -> Result<(), CoinsError> {
        self.shard.cache.get_mut().batch_write(&mut changes.coins)?;
        if let Some(hash) = changes.best_block {
            self.set_best_block(hash);
        }
        Ok(())
    }
}

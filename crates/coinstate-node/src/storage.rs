//! RocksDB-backed persistent state.
//!
//! [`RocksStore`] keeps unspent coins, per-file block accounting and a few
//! metadata keys in separate column families. Every multi-key mutation goes
//! through one [`WriteBatch`].
//!
//! [`RocksCoinsView`] puts a storage-owning [`CoinsStore`] level in front of
//! the coin column family. It is the bottom of the cache hierarchy: child
//! caches flush into it, and [`RocksCoinsView::flush`] writes its dirty
//! entries to disk together with the best block.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Options, WriteBatch};
use tracing::{debug, info};

use coinstate_core::coin::{CoinImpl, CoinWithScript};
use coinstate_core::coins_store::CoinsStore;
use coinstate_core::error::CoinsError;
use coinstate_core::traits::{CoinsChanges, CoinsView, CoinsViewWrite};
use coinstate_core::types::{Hash256, OutPoint, Transaction};

use crate::block_files::BlockFileInfo;
use crate::error::StorageError;

const CF_COINS: &str = "coins";
const CF_BLOCK_FILES: &str = "block_files";
const CF_METADATA: &str = "metadata";

const ALL_CFS: &[&str] = &[CF_COINS, CF_BLOCK_FILES, CF_METADATA];

const META_BEST_BLOCK: &[u8] = b"best_block";
const META_LAST_BLOCK_FILE: &[u8] = b"last_block_file";
const META_TIP_HEIGHT: &[u8] = b"tip_height";

/// Persistence of per-file block accounting.
pub trait BlockTreeDb {
    fn read_block_file_info(&self, file: u32) -> Result<Option<BlockFileInfo>, StorageError>;

    /// Write file records and the last file number atomically.
    fn write_block_file_info(
        &self,
        files: &[(u32, BlockFileInfo)],
        last_block_file: u32,
    ) -> Result<(), StorageError>;

    fn read_last_block_file(&self) -> Result<Option<u32>, StorageError>;
}

/// Coins, block file records and metadata in one RocksDB instance.
pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    /// Open or create the database, creating missing column families.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors)
            .map_err(|e| StorageError::Rocks(e.to_string()))?;
        info!(path = %path.as_ref().display(), "opened chainstate database");
        Ok(Self { db })
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::MissingColumnFamily(name.to_string()))
    }

    fn encode_outpoint(outpoint: &OutPoint) -> Result<Vec<u8>, StorageError> {
        bincode::encode_to_vec(outpoint, bincode::config::standard())
            .map_err(|e| StorageError::Encoding(e.to_string()))
    }

    /// File numbers are big-endian so keys sort by file.
    fn file_key(file: u32) -> [u8; 4] {
        file.to_be_bytes()
    }

    fn get_meta(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let cf = self.cf_handle(CF_METADATA)?;
        self.db
            .get_cf(&cf, key)
            .map_err(|e| StorageError::Rocks(e.to_string()))
    }

    /// Unspent coin stored for `outpoint`.
    pub fn read_coin(&self, outpoint: &OutPoint) -> Result<Option<CoinWithScript>, StorageError> {
        let cf = self.cf_handle(CF_COINS)?;
        let key = Self::encode_outpoint(outpoint)?;
        match self
            .db
            .get_cf(&cf, key)
            .map_err(|e| StorageError::Rocks(e.to_string()))?
        {
            Some(data) => {
                let (coin, _): (CoinWithScript, _) =
                    bincode::decode_from_slice(&data, bincode::config::standard())
                        .map_err(|e| StorageError::Encoding(e.to_string()))?;
                Ok(Some(coin))
            }
            None => Ok(None),
        }
    }

    pub fn best_block(&self) -> Result<Option<Hash256>, StorageError> {
        match self.get_meta(META_BEST_BLOCK)? {
            Some(bytes) => {
                let hash: [u8; 32] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StorageError::Corrupt("best block hash length".into()))?;
                Ok(Some(Hash256(hash)))
            }
            None => Ok(None),
        }
    }

    /// Apply coin writes (`Some`) and deletions (`None`) together with an
    /// optional new best block, atomically.
    pub fn write_coins(
        &self,
        updates: &[(OutPoint, Option<CoinWithScript>)],
        best_block: Option<Hash256>,
    ) -> Result<(), StorageError> {
        let cf_coins = self.cf_handle(CF_COINS)?;
        let cf_meta = self.cf_handle(CF_METADATA)?;
        let mut batch = WriteBatch::default();

        for (outpoint, coin) in updates {
            let key = Self::encode_outpoint(outpoint)?;
            match coin {
                Some(coin) => {
                    let value = bincode::encode_to_vec(coin, bincode::config::standard())
                        .map_err(|e| StorageError::Encoding(e.to_string()))?;
                    batch.put_cf(&cf_coins, key, value);
                }
                None => batch.delete_cf(&cf_coins, key),
            }
        }
        if let Some(hash) = best_block {
            batch.put_cf(&cf_meta, META_BEST_BLOCK, hash.as_bytes());
        }

        self.db
            .write(batch)
            .map_err(|e| StorageError::Rocks(e.to_string()))
    }

    /// Height of the block the stored coins correspond to.
    pub fn tip_height(&self) -> Result<Option<u32>, StorageError> {
        match self.get_meta(META_TIP_HEIGHT)? {
            Some(bytes) => {
                let raw: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StorageError::Corrupt("tip height length".into()))?;
                Ok(Some(u32::from_le_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    /// Record the tip height; `None` removes it.
    pub fn set_tip_height(&self, height: Option<u32>) -> Result<(), StorageError> {
        let cf = self.cf_handle(CF_METADATA)?;
        let result = match height {
            Some(height) => self.db.put_cf(&cf, META_TIP_HEIGHT, height.to_le_bytes()),
            None => self.db.delete_cf(&cf, META_TIP_HEIGHT),
        };
        result.map_err(|e| StorageError::Rocks(e.to_string()))
    }

    /// Number of stored coins. Walks the whole column family.
    pub fn coin_count(&self) -> Result<usize, StorageError> {
        let cf = self.cf_handle(CF_COINS)?;
        let mut count = 0;
        for item in self.db.iterator_cf(&cf, rocksdb::IteratorMode::Start) {
            item.map_err(|e| StorageError::Rocks(e.to_string()))?;
            count += 1;
        }
        Ok(count)
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db
            .flush()
            .map_err(|e| StorageError::Rocks(e.to_string()))
    }
}

impl BlockTreeDb for RocksStore {
    fn read_block_file_info(&self, file: u32) -> Result<Option<BlockFileInfo>, StorageError> {
        let cf = self.cf_handle(CF_BLOCK_FILES)?;
        match self
            .db
            .get_cf(&cf, Self::file_key(file))
            .map_err(|e| StorageError::Rocks(e.to_string()))?
        {
            Some(data) => {
                let (info, _): (BlockFileInfo, _) =
                    bincode::decode_from_slice(&data, bincode::config::standard())
                        .map_err(|e| StorageError::Encoding(e.to_string()))?;
                Ok(Some(info))
            }
            None => Ok(None),
        }
    }

    fn write_block_file_info(
        &self,
        files: &[(u32, BlockFileInfo)],
        last_block_file: u32,
    ) -> Result<(), StorageError> {
        let cf_files = self.cf_handle(CF_BLOCK_FILES)?;
        let cf_meta = self.cf_handle(CF_METADATA)?;
        let mut batch = WriteBatch::default();

        for (file, info) in files {
            let value = bincode::encode_to_vec(info, bincode::config::standard())
                .map_err(|e| StorageError::Encoding(e.to_string()))?;
            batch.put_cf(&cf_files, Self::file_key(*file), value);
        }
        batch.put_cf(&cf_meta, META_LAST_BLOCK_FILE, last_block_file.to_le_bytes());

        self.db
            .write(batch)
            .map_err(|e| StorageError::Rocks(e.to_string()))?;
        debug!(files = files.len(), last_block_file, "wrote block file info");
        Ok(())
    }

    fn read_last_block_file(&self) -> Result<Option<u32>, StorageError> {
        match self.get_meta(META_LAST_BLOCK_FILE)? {
            Some(bytes) => {
                let raw: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StorageError::Corrupt("last block file length".into()))?;
                Ok(Some(u32::from_le_bytes(raw)))
            }
            None => Ok(None),
        }
    }
}

/// The storage-owning cache level over [`RocksStore`].
///
/// Scripts this level holds are handed to children as borrowed handles;
/// scripts read straight from disk are handed out as owning copies while
/// this level keeps only a shell.
pub struct RocksCoinsView {
    store: Arc<RocksStore>,
    cache: Mutex<CoinsStore>,
    best_block: Option<Hash256>,
}

impl RocksCoinsView {
    pub fn new(store: Arc<RocksStore>) -> Self {
        Self {
            store,
            cache: Mutex::new(CoinsStore::new()),
            best_block: None,
        }
    }

    pub fn store(&self) -> &Arc<RocksStore> {
        &self.store
    }

    pub fn dynamic_memory_usage(&self) -> usize {
        self.cache.lock().dynamic_memory_usage()
    }

    /// Number of entries held in memory.
    pub fn cache_size(&self) -> usize {
        self.cache.lock().len()
    }

    /// Write dirty entries and the best block to disk, then empty the
    /// in-memory level. Returns the number of coins written or deleted.
    pub fn flush(&self) -> Result<usize, StorageError> {
        let mut cache = self.cache.lock();

        let mut updates = Vec::new();
        for (outpoint, entry) in cache.entries() {
            if !entry.is_dirty() {
                continue;
            }
            if entry.coin.is_spent() {
                updates.push((*outpoint, None));
                continue;
            }
            let coin = entry.coin.make_owning().ok_or_else(|| {
                StorageError::Corrupt(format!("dirty coin without script: {outpoint}"))
            })?;
            updates.push((*outpoint, Some(coin)));
        }

        self.store.write_coins(&updates, self.best_block)?;
        let dropped = cache.len();
        cache.clear();
        info!(written = updates.len(), dropped, "flushed coins to disk");
        Ok(updates.len())
    }

    fn read_owned(&self, outpoint: &OutPoint) -> Result<Option<CoinImpl>, CoinsError> {
        Ok(self
            .store
            .read_coin(outpoint)?
            .map(CoinImpl::from_coin_with_script))
    }
}

impl CoinsView for RocksCoinsView {
    fn get_coin(&self, outpoint: &OutPoint, max_script_size: u64) -> Result<Option<CoinImpl>, CoinsError> {
        let mut cache = self.cache.lock();

        if let Some(entry) = cache.get_entry(outpoint) {
            let coin = &entry.coin;
            let wants_script = coin.script_size() as u64 <= max_script_size;
            if coin.is_spent() || coin.has_script() || !wants_script {
                return Ok(cache.fetch_coin(outpoint));
            }
            // Cached shell, script requested: the caller gets its own copy.
            return match self.read_owned(outpoint)? {
                Some(coin) => Ok(Some(coin)),
                None => Err(StorageError::Corrupt(format!("cached coin missing on disk: {outpoint}")).into()),
            };
        }

        let Some(coin) = self.read_owned(outpoint)? else {
            return Ok(None);
        };
        cache.add_fetched(*outpoint, coin.to_shell());
        if coin.script_size() as u64 <= max_script_size {
            Ok(Some(coin))
        } else {
            Ok(Some(coin.to_shell()))
        }
    }

    fn get_best_block(&self) -> Result<Hash256, CoinsError> {
        if let Some(hash) = self.best_block {
            return Ok(hash);
        }
        Ok(self.store.best_block()?.unwrap_or(Hash256::ZERO))
    }

    /// Load the full coin, script included, for every input of `txs` into
    /// this level.
    fn cache_all_coins(&self, txs: &[Transaction]) -> Result<(), CoinsError> {
        let mut cache = self.cache.lock();
        let mut loaded = 0usize;
        for tx in txs.iter().filter(|tx| !tx.is_coinbase()) {
            for input in &tx.inputs {
                let outpoint = &input.prevout;
                if cache.get_entry(outpoint).is_some() {
                    continue;
                }
                if let Some(coin) = self.read_owned(outpoint)? {
                    cache.add_fetched(*outpoint, coin);
                    loaded += 1;
                }
            }
        }
        debug!(loaded, "warmed coins for transactions");
        Ok(())
    }
}

impl CoinsViewWrite for RocksCoinsView {
    fn batch_write(&mut self, mut changes: CoinsChanges) -> Result<(), CoinsError> {
        self.cache.get_mut().batch_write(&mut changes.coins)?;
        if let Some(hash) = changes.best_block {
            self.best_block = Some(hash);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coinstate_core::coins_store::{CoinsCacheEntry, CoinsMap, EntryFlags};
    use coinstate_core::types::{Script, TxIn, TxOut};

    fn temp_store() -> (Arc<RocksStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path().join("chainstate")).unwrap();
        (Arc::new(store), dir)
    }

    fn op(n: u8) -> OutPoint {
        OutPoint::new(Hash256([n; 32]), u32::from(n))
    }

    fn coin(value: u64, script_len: usize) -> CoinWithScript {
        CoinWithScript::new(TxOut::new(value, Script::new(vec![0x51; script_len])), 5, false, false)
    }

    fn dirty(coin: CoinImpl) -> CoinsCacheEntry {
        CoinsCacheEntry::new(coin, EntryFlags::DIRTY)
    }

    fn seed(store: &RocksStore, coins: &[(OutPoint, CoinWithScript)]) {
        let updates: Vec<_> = coins.iter().map(|(o, c)| (*o, Some(c.clone()))).collect();
        store.write_coins(&updates, Some(Hash256([9; 32]))).unwrap();
    }

    #[test]
    fn coins_round_trip_through_rocks() {
        let (store, _dir) = temp_store();
        assert_eq!(store.read_coin(&op(1)).unwrap(), None);
        assert_eq!(store.best_block().unwrap(), None);

        seed(&store, &[(op(1), coin(100, 3))]);
        assert_eq!(store.read_coin(&op(1)).unwrap(), Some(coin(100, 3)));
        assert_eq!(store.best_block().unwrap(), Some(Hash256([9; 32])));

        store.write_coins(&[(op(1), None)], None).unwrap();
        assert_eq!(store.read_coin(&op(1)).unwrap(), None);
        assert_eq!(store.coin_count().unwrap(), 0);
    }

    #[test]
    fn tip_height_set_and_cleared() {
        let (store, _dir) = temp_store();
        assert_eq!(store.tip_height().unwrap(), None);
        store.set_tip_height(Some(42)).unwrap();
        assert_eq!(store.tip_height().unwrap(), Some(42));
        store.set_tip_height(None).unwrap();
        assert_eq!(store.tip_height().unwrap(), None);
    }

    #[test]
    fn block_file_info_round_trip() {
        let (store, _dir) = temp_store();
        assert_eq!(store.read_last_block_file().unwrap(), None);

        let mut info = BlockFileInfo::default();
        info.add_new_block(10, 1_000, 500);
        info.add_undo_size(40);
        store.write_block_file_info(&[(0, BlockFileInfo::default()), (1, info.clone())], 1).unwrap();

        assert_eq!(store.read_block_file_info(1).unwrap(), Some(info));
        assert_eq!(store.read_block_file_info(0).unwrap(), Some(BlockFileInfo::default()));
        assert_eq!(store.read_block_file_info(2).unwrap(), None);
        assert_eq!(store.read_last_block_file().unwrap(), Some(1));
    }

    #[test]
    fn reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chainstate");
        {
            let store = RocksStore::open(&path).unwrap();
            seed(&store, &[(op(2), coin(7, 1))]);
            store.flush().unwrap();
        }
        let store = RocksStore::open(&path).unwrap();
        assert_eq!(store.read_coin(&op(2)).unwrap(), Some(coin(7, 1)));
    }

    #[test]
    fn disk_reads_hand_out_owning_coins_and_keep_shells() {
        let (store, _dir) = temp_store();
        seed(&store, &[(op(1), coin(100, 3))]);
        let view = RocksCoinsView::new(store);

        let full = view.get_coin(&op(1), u64::MAX).unwrap().unwrap();
        assert!(full.has_script());
        assert!(full.is_storage_owner());
        assert_eq!(view.cache_size(), 1);
        assert!(view.dynamic_memory_usage() > 0);

        // Second request hits the cached shell and still returns the script.
        let again = view.get_coin(&op(1), u64::MAX).unwrap().unwrap();
        assert!(again.has_script());
        let shell = view.get_coin(&op(1), 0).unwrap().unwrap();
        assert!(!shell.has_script());
        assert_eq!(shell.script_size(), 3);

        assert_eq!(view.get_coin(&op(2), u64::MAX).unwrap(), None);
        assert_eq!(view.get_best_block().unwrap(), Hash256([9; 32]));
    }

    #[test]
    fn warmed_coins_are_lent_to_children() {
        let (store, _dir) = temp_store();
        seed(&store, &[(op(1), coin(100, 3))]);
        let view = RocksCoinsView::new(store);

        let tx = Transaction {
            version: 1,
            inputs: vec![TxIn::new(op(1)), TxIn::new(op(2))],
            outputs: vec![TxOut::new(90, Script::default())],
            lock_time: 0,
        };
        view.cache_all_coins(std::slice::from_ref(&tx)).unwrap();
        assert_eq!(view.cache_size(), 1);

        let lent = view.get_coin(&op(1), u64::MAX).unwrap().unwrap();
        assert!(lent.has_script());
        assert!(!lent.is_storage_owner());
    }

    #[test]
    fn batch_write_then_flush_persists_changes() {
        let (store, _dir) = temp_store();
        seed(&store, &[(op(1), coin(100, 3))]);
        let mut view = RocksCoinsView::new(store.clone());
        assert!(view.have_coin(&op(1)).unwrap());

        let mut coins = CoinsMap::new();
        coins.insert(op(1), dirty(CoinImpl::spent()));
        coins.insert(
            op(2),
            CoinsCacheEntry::new(
                CoinImpl::from_coin_with_script(coin(50, 2)),
                EntryFlags::DIRTY | EntryFlags::FRESH,
            ),
        );
        view.batch_write(CoinsChanges {
            coins,
            best_block: Some(Hash256([3; 32])),
        })
        .unwrap();

        // Not on disk yet.
        assert!(store.read_coin(&op(1)).unwrap().is_some());
        assert!(!view.have_coin(&op(1)).unwrap());
        assert_eq!(view.get_best_block().unwrap(), Hash256([3; 32]));

        assert_eq!(view.flush().unwrap(), 2);
        assert_eq!(view.cache_size(), 0);
        assert_eq!(store.read_coin(&op(1)).unwrap(), None);
        assert_eq!(store.read_coin(&op(2)).unwrap(), Some(coin(50, 2)));
        assert_eq!(store.best_block().unwrap(), Some(Hash256([3; 32])));
    }

    #[test]
    fn fresh_child_over_unspent_disk_coin_is_rejected() {
        let (store, _dir) = temp_store();
        seed(&store, &[(op(1), coin(100, 3))]);
        let mut view = RocksCoinsView::new(store);
        view.get_coin(&op(1), 0).unwrap();

        let mut coins = CoinsMap::new();
        coins.insert(
            op(1),
            CoinsCacheEntry::new(
                CoinImpl::from_coin_with_script(coin(1, 1)),
                EntryFlags::DIRTY | EntryFlags::FRESH,
            ),
        );
        let err = view
            .batch_write(CoinsChanges { coins, best_block: None })
            .unwrap_err();
        assert_eq!(err, CoinsError::FreshMisapplied(op(1)));
    }

    #[test]
    fn concurrent_readers_share_the_view() {
        let (store, _dir) = temp_store();
        let coins: Vec<_> = (1..=20u8).map(|n| (op(n), coin(u64::from(n), 4))).collect();
        seed(&store, &coins);
        let view = RocksCoinsView::new(store);

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for n in 1..=20u8 {
                        let got = view.get_coin(&op(n), u64::MAX).unwrap().unwrap();
                        assert_eq!(got.value(), u64::from(n));
                    }
                });
            }
        });
        assert_eq!(view.cache_size(), 20);
    }
}

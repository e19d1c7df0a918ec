//! Shared builders for the integration tests.

use std::sync::Arc;

use coinstate_core::coin::CoinWithScript;
use coinstate_core::types::{Block, Hash256, OutPoint, Script, Transaction, TxIn, TxOut};
use coinstate_node_lib::block_file_access::NoopFileAccess;
use coinstate_node_lib::block_files::BlockFileInfoStore;

/// Outpoint whose txid is filled with `seed`.
pub fn outpoint(seed: u8, index: u32) -> OutPoint {
    OutPoint::new(Hash256([seed; 32]), index)
}

/// A spendable script of `len` bytes.
pub fn script(len: usize) -> Script {
    Script::new(vec![0x51; len])
}

pub fn coin(value: u64, height: u32) -> CoinWithScript {
    CoinWithScript::new(TxOut::new(value, script(25)), height, false, false)
}

pub fn coin_with_script_len(value: u64, height: u32, len: usize) -> CoinWithScript {
    CoinWithScript::new(TxOut::new(value, script(len)), height, false, false)
}

/// Coinbase with `lock_time` set to `height` so txids differ per block.
pub fn make_coinbase(value: u64, height: u32) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn::new(OutPoint::null())],
        outputs: vec![TxOut::new(value, script(25))],
        lock_time: height,
    }
}

pub fn make_tx(inputs: Vec<OutPoint>, outputs: Vec<TxOut>) -> Transaction {
    Transaction {
        version: 1,
        inputs: inputs.into_iter().map(TxIn::new).collect(),
        outputs,
        lock_time: 0,
    }
}

pub fn make_block(prev_block: Hash256, time: u32, transactions: Vec<Transaction>) -> Block {
    Block {
        prev_block,
        time,
        transactions,
    }
}

/// A block file store that touches no files.
pub fn accounting_store() -> BlockFileInfoStore {
    BlockFileInfoStore::new(Arc::new(NoopFileAccess))
}

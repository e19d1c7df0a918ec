//! Connecting transactions to the coin set, and rolling blocks back.
//!
//! [`add_coins`] is the single entry point for turning a transaction's
//! outputs into coins. [`connect_block`] spends inputs into [`BlockUndo`]
//! records and [`apply_block_undo`] replays those records backwards to
//! disconnect the block again.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cancellation::CancellationToken;
use crate::coin::CoinWithScript;
use crate::coins_cache::CoinsViewCache;
use crate::error::CoinsError;
use crate::types::{Block, OutPoint, Transaction};

/// Previous outputs consumed by one transaction, in input order.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
    bincode::Encode, bincode::Decode,
)]
pub struct TxUndo {
    pub prevouts: Vec<CoinWithScript>,
}

/// Undo records for every non-coinbase transaction of a block.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockUndo {
    pub tx_undo: Vec<TxUndo>,
}

impl BlockUndo {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CoinsError> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CoinsError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoinsError> {
        let (undo, _) = bincode::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CoinsError::Serialization(e.to_string()))?;
        Ok(undo)
    }
}

/// Outcome of rolling back a block or a single spend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectResult {
    /// Rolled back and the coin set matched the block.
    Ok,
    /// Rolled back, but the coin set was inconsistent with the block.
    Unclean,
    /// Undo data did not fit the block; nothing sensible could be done.
    Failed,
}

/// Add every output of `tx` as a new coin at `height`.
///
/// With `check_for_overwrite` the overwrite permission for each output is
/// whether a coin already exists there. Without it, coinbase outputs may
/// overwrite (duplicate coinbases exist in early chain history) and all
/// other outputs may not.
pub fn add_coins(
    cache: &mut CoinsViewCache<'_>,
    tx: &Transaction,
    is_confiscation: bool,
    height: u32,
    genesis_activation_height: u32,
    check_for_overwrite: bool,
) -> Result<(), CoinsError> {
    let is_coinbase = tx.is_coinbase();
    let txid = tx.txid()?;
    for (index, out) in tx.outputs.iter().enumerate() {
        let outpoint = OutPoint::new(txid, index as u32);
        let possible_overwrite = if check_for_overwrite {
            cache.have_coin(&outpoint)?
        } else {
            is_coinbase
        };
        let coin = CoinWithScript::new(out.clone(), height, is_coinbase, is_confiscation);
        cache.add_coin(outpoint, coin, possible_overwrite, genesis_activation_height)?;
    }
    Ok(())
}

/// Spend the inputs of `tx` and add its outputs, returning the spent coins.
///
/// # Panics
///
/// If an input is not an unspent coin of `cache`. Inputs must be checked
/// before a transaction is connected.
pub fn update_coins(
    cache: &mut CoinsViewCache<'_>,
    tx: &Transaction,
    height: u32,
    genesis_activation_height: u32,
) -> Result<TxUndo, CoinsError> {
    let mut undo = TxUndo::default();
    if !tx.is_coinbase() {
        undo.prevouts.reserve(tx.inputs.len());
        for input in &tx.inputs {
            let spent = cache.spend_coin_take(&input.prevout)?;
            match spent {
                Some(coin) if !coin.is_spent() => undo.prevouts.push(coin),
                _ => panic!("update_coins: input {} is not an unspent coin", input.prevout),
            }
        }
    }
    add_coins(cache, tx, false, height, genesis_activation_height, false)?;
    Ok(undo)
}

/// Connect every transaction of `block` and move the best block to it.
pub fn connect_block(
    cache: &mut CoinsViewCache<'_>,
    block: &Block,
    height: u32,
    genesis_activation_height: u32,
) -> Result<BlockUndo, CoinsError> {
    let mut block_undo = BlockUndo::default();
    for (i, tx) in block.transactions.iter().enumerate() {
        let undo = update_coins(cache, tx, height, genesis_activation_height)?;
        if i > 0 {
            block_undo.tx_undo.push(undo);
        }
    }
    let hash = block.hash()?;
    cache.set_best_block(hash);
    debug!(%hash, height, txs = block.transactions.len(), "connected block to coins cache");
    Ok(block_undo)
}

/// Restore a spent coin from its undo record.
///
/// The result is unclean when a coin is already present at `outpoint`; it is
/// overwritten in that case.
pub fn undo_coin_spend(
    undo: &CoinWithScript,
    cache: &mut CoinsViewCache<'_>,
    outpoint: &OutPoint,
    genesis_activation_height: u32,
) -> Result<DisconnectResult, CoinsError> {
    let clean = !cache.have_coin(outpoint)?;
    cache.add_coin(*outpoint, undo.clone(), !clean, genesis_activation_height)?;
    Ok(if clean {
        DisconnectResult::Ok
    } else {
        DisconnectResult::Unclean
    })
}

/// Disconnect `block` (connected at `height`) from `cache` using its undo
/// data, and move the best block back to its parent.
///
/// Transactions are processed last to first. The token is polled before
/// each one; cancellation leaves the cache partially rolled back and is
/// reported as [`CoinsError::Cancelled`].
pub fn apply_block_undo(
    cache: &mut CoinsViewCache<'_>,
    block: &Block,
    block_undo: &BlockUndo,
    height: u32,
    genesis_activation_height: u32,
    token: &CancellationToken,
) -> Result<DisconnectResult, CoinsError> {
    if block_undo.tx_undo.len() + 1 != block.transactions.len() {
        warn!(
            undo_txs = block_undo.tx_undo.len(),
            block_txs = block.transactions.len(),
            "block and undo data inconsistent"
        );
        return Ok(DisconnectResult::Failed);
    }

    let genesis_enabled = height >= genesis_activation_height;
    let mut clean = true;

    for (i, tx) in block.transactions.iter().enumerate().rev() {
        if token.is_cancelled() {
            return Err(CoinsError::Cancelled);
        }

        let txid = tx.txid()?;
        let is_coinbase = tx.is_coinbase();
        for (index, out) in tx.outputs.iter().enumerate() {
            if out.script_pubkey.is_unspendable(genesis_enabled) {
                continue;
            }
            let outpoint = OutPoint::new(txid, index as u32);
            let matches = match cache.spend_coin_take(&outpoint)? {
                Some(coin) if !coin.is_spent() => {
                    coin.tx_out() == out
                        && coin.height() == height
                        && coin.is_coinbase() == is_coinbase
                }
                _ => false,
            };
            if !matches {
                clean = false;
            }
        }

        if i == 0 {
            continue;
        }
        let tx_undo = &block_undo.tx_undo[i - 1];
        if tx_undo.prevouts.len() != tx.inputs.len() {
            warn!(%txid, "transaction and undo data inconsistent");
            return Ok(DisconnectResult::Failed);
        }
        for (input, undo) in tx.inputs.iter().zip(&tx_undo.prevouts).rev() {
            match undo_coin_spend(undo, cache, &input.prevout, genesis_activation_height)? {
                DisconnectResult::Ok => {}
                DisconnectResult::Unclean => clean = false,
                DisconnectResult::Failed => return Ok(DisconnectResult::Failed),
            }
        }
    }

    cache.set_best_block(block.prev_block);
    if clean {
        Ok(DisconnectResult::Ok)
    } else {
        warn!(height, "disconnected block with unclean coin set");
        Ok(DisconnectResult::Unclean)
    }
}

//! Chain primitives consumed by the coin cache: hashes, outpoints, scripts,
//! transaction inputs/outputs and transactions.
//!
//! All monetary values are in satoshis. Heights are `u32`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::constants::{MAX_SCRIPT_SIZE_BEFORE_GENESIS, OP_FALSE, OP_RETURN};
use crate::error::CoinsError;

/// A 32-byte hash value. Used for transaction ids and block hashes.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// All-zero hash. Marks "no best block yet" and coinbase prevouts.
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// Identity of a coin: the creating transaction and the output index.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct OutPoint {
    pub txid: Hash256,
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: Hash256, index: u32) -> Self {
        Self { txid, index }
    }

    /// The outpoint referenced by a coinbase input.
    pub fn null() -> Self {
        Self {
            txid: Hash256::ZERO,
            index: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.index == u32::MAX
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// Locking script bytes of an output.
///
/// The cache never interprets scripts; it only needs to know whether an
/// output can ever be spent.
#[derive(
    Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub struct Script(pub Vec<u8>);

impl Script {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether an output locked by this script can provably never be spent.
    ///
    /// The `OP_FALSE OP_RETURN` data-carrier prefix is unspendable at any
    /// height. Before genesis activation so is any script starting with
    /// `OP_RETURN` or exceeding the legacy script size limit.
    pub fn is_unspendable(&self, genesis_enabled: bool) -> bool {
        if self.is_data_carrier() {
            return true;
        }
        !genesis_enabled
            && (self.0.first() == Some(&OP_RETURN) || self.0.len() > MAX_SCRIPT_SIZE_BEFORE_GENESIS)
    }

    fn is_data_carrier(&self) -> bool {
        self.0.starts_with(&[OP_FALSE, OP_RETURN])
    }
}

impl From<Vec<u8>> for Script {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// A transaction output.
#[derive(
    Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxOut {
    /// Value in satoshis.
    pub value: u64,
    pub script_pubkey: Script,
}

impl TxOut {
    pub fn new(value: u64, script_pubkey: Script) -> Self {
        Self {
            value,
            script_pubkey,
        }
    }
}

/// A transaction input.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxIn {
    /// The outpoint being spent. Null for coinbase.
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    pub fn new(prevout: OutPoint) -> Self {
        Self {
            prevout,
            script_sig: Vec::new(),
            sequence: u32::MAX,
        }
    }
}

#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    /// Double SHA-256 of the canonical bincode encoding.
    pub fn txid(&self) -> Result<Hash256, CoinsError> {
        let encoded = bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CoinsError::Serialization(e.to_string()))?;
        let first = Sha256::digest(&encoded);
        Ok(Hash256(Sha256::digest(first).into()))
    }

    /// Single input spending the null outpoint.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }
}

/// A block as far as the coin set is concerned: its parent and its
/// transactions, coinbase first.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Block {
    pub prev_block: Hash256,
    pub time: u32,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Double SHA-256 of the canonical bincode encoding.
    pub fn hash(&self) -> Result<Hash256, CoinsError> {
        let encoded = bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CoinsError::Serialization(e.to_string()))?;
        let first = Sha256::digest(&encoded);
        Ok(Hash256(Sha256::digest(first).into()))
    }

    /// Serialized size in bytes, as stored in a block file.
    pub fn serialized_size(&self) -> Result<u64, CoinsError> {
        let encoded = bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CoinsError::Serialization(e.to_string()))?;
        Ok(encoded.len() as u64)
    }
}

//! Coin representations.
//!
//! - [`Coin`] is the cheap, script-less view handed to validation code that
//!   only needs value and metadata.
//! - [`CoinWithScript`] owns its full output and can be used standalone.
//! - [`CoinImpl`] is what cache levels store: metadata plus a [`ScriptSlot`]
//!   recording whether this level owns the script bytes, borrows them from a
//!   lower level, or has not loaded them at all.
//!
//! A spent coin is a tombstone: it is a real value carrying no meaningful
//! amount or script, distinct from "no entry".

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::{Script, TxOut};

/// Where a cached coin's locking script lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScriptSlot {
    /// This cache level is the storage owner of the bytes.
    Owned(Arc<Script>),
    /// The bytes are owned by a lower cache level; this is a handle to them.
    Borrowed(Arc<Script>),
    /// Script not loaded; only its size is known.
    Unloaded { size: usize },
}

impl ScriptSlot {
    pub fn size(&self) -> usize {
        match self {
            Self::Owned(script) | Self::Borrowed(script) => script.len(),
            Self::Unloaded { size } => *size,
        }
    }

    pub fn script(&self) -> Option<&Arc<Script>> {
        match self {
            Self::Owned(script) | Self::Borrowed(script) => Some(script),
            Self::Unloaded { .. } => None,
        }
    }
}

/// Script-less coin view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    value: u64,
    script_size: usize,
    height: u32,
    is_coinbase: bool,
    is_confiscation: bool,
    spent: bool,
}

impl Coin {
    pub fn new(
        value: u64,
        script_size: usize,
        height: u32,
        is_coinbase: bool,
        is_confiscation: bool,
    ) -> Self {
        Self {
            value,
            script_size,
            height,
            is_coinbase,
            is_confiscation,
            spent: false,
        }
    }

    /// The spent tombstone.
    pub fn spent() -> Self {
        Self {
            value: 0,
            script_size: 0,
            height: 0,
            is_coinbase: false,
            is_confiscation: false,
            spent: true,
        }
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn script_size(&self) -> usize {
        self.script_size
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_coinbase(&self) -> bool {
        self.is_coinbase
    }

    pub fn is_confiscation(&self) -> bool {
        self.is_confiscation
    }

    pub fn is_spent(&self) -> bool {
        self.spent
    }
}

/// Coin that owns its complete output, script included.
#[derive(
    Clone, Debug, PartialEq, Eq, Serialize, Deserialize,
    bincode::Encode, bincode::Decode,
)]
pub struct CoinWithScript {
    out: TxOut,
    height: u32,
    is_coinbase: bool,
    is_confiscation: bool,
    spent: bool,
}

impl CoinWithScript {
    pub fn new(out: TxOut, height: u32, is_coinbase: bool, is_confiscation: bool) -> Self {
        Self {
            out,
            height,
            is_coinbase,
            is_confiscation,
            spent: false,
        }
    }

    /// The spent tombstone.
    pub fn spent() -> Self {
        Self {
            out: TxOut::default(),
            height: 0,
            is_coinbase: false,
            is_confiscation: false,
            spent: true,
        }
    }

    /// The full output. Meaningless on a spent coin.
    pub fn tx_out(&self) -> &TxOut {
        debug_assert!(!self.spent, "tx_out() on a spent coin");
        &self.out
    }

    pub fn into_tx_out(self) -> TxOut {
        self.out
    }

    pub fn value(&self) -> u64 {
        self.out.value
    }

    pub fn script_size(&self) -> usize {
        self.out.script_pubkey.len()
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_coinbase(&self) -> bool {
        self.is_coinbase
    }

    pub fn is_confiscation(&self) -> bool {
        self.is_confiscation
    }

    pub fn is_spent(&self) -> bool {
        self.spent
    }

    pub fn has_script(&self) -> bool {
        true
    }

    /// Drop the script, keeping its size.
    pub fn to_coin(&self) -> Coin {
        if self.spent {
            return Coin::spent();
        }
        Coin::new(
            self.out.value,
            self.out.script_pubkey.len(),
            self.height,
            self.is_coinbase,
            self.is_confiscation,
        )
    }
}

/// Cache-level coin with an explicit script ownership tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoinImpl {
    value: u64,
    script: ScriptSlot,
    height: u32,
    is_coinbase: bool,
    is_confiscation: bool,
    spent: bool,
}

impl CoinImpl {
    /// The spent tombstone.
    pub fn spent() -> Self {
        Self {
            value: 0,
            script: ScriptSlot::Unloaded { size: 0 },
            height: 0,
            is_coinbase: false,
            is_confiscation: false,
            spent: true,
        }
    }

    /// A storage-owning coin whose script has not been loaded.
    pub fn shell(
        value: u64,
        script_size: usize,
        height: u32,
        is_coinbase: bool,
        is_confiscation: bool,
    ) -> Self {
        Self {
            value,
            script: ScriptSlot::Unloaded { size: script_size },
            height,
            is_coinbase,
            is_confiscation,
            spent: false,
        }
    }

    /// Take ownership of a full coin's script.
    pub fn from_coin_with_script(coin: CoinWithScript) -> Self {
        if coin.spent {
            return Self::spent();
        }
        Self {
            value: coin.out.value,
            script: ScriptSlot::Owned(Arc::new(coin.out.script_pubkey)),
            height: coin.height,
            is_coinbase: coin.is_coinbase,
            is_confiscation: coin.is_confiscation,
            spent: false,
        }
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_coinbase(&self) -> bool {
        self.is_coinbase
    }

    pub fn is_confiscation(&self) -> bool {
        self.is_confiscation
    }

    pub fn is_spent(&self) -> bool {
        self.spent
    }

    pub fn script_size(&self) -> usize {
        self.script.size()
    }

    pub fn script_slot(&self) -> &ScriptSlot {
        &self.script
    }

    /// Whether script bytes are physically reachable from this instance.
    pub fn has_script(&self) -> bool {
        self.script.script().is_some()
    }

    /// False only for handles into a lower level's storage.
    pub fn is_storage_owner(&self) -> bool {
        !matches!(self.script, ScriptSlot::Borrowed(_))
    }

    /// Script bytes this instance accounts for as their owner.
    pub fn owned_script_bytes(&self) -> usize {
        match &self.script {
            ScriptSlot::Owned(script) => script.len(),
            _ => 0,
        }
    }

    /// A handle sharing this coin's script without claiming ownership of it.
    pub fn make_non_owning(&self) -> Self {
        let script = match &self.script {
            ScriptSlot::Owned(script) | ScriptSlot::Borrowed(script) => {
                ScriptSlot::Borrowed(Arc::clone(script))
            }
            ScriptSlot::Unloaded { size } => ScriptSlot::Unloaded { size: *size },
        };
        Self {
            script,
            ..self.clone()
        }
    }

    /// A storage-owning copy with the script dropped.
    pub fn to_shell(&self) -> Self {
        Self {
            script: ScriptSlot::Unloaded {
                size: self.script.size(),
            },
            ..self.clone()
        }
    }

    pub fn to_coin(&self) -> Coin {
        if self.spent {
            return Coin::spent();
        }
        Coin::new(
            self.value,
            self.script.size(),
            self.height,
            self.is_coinbase,
            self.is_confiscation,
        )
    }

    /// Standalone owning copy. `None` when the script still has to be
    /// fetched from a backing view.
    pub fn make_owning(&self) -> Option<CoinWithScript> {
        if self.spent {
            return Some(CoinWithScript::spent());
        }
        let script = self.script.script()?;
        Some(CoinWithScript::new(
            TxOut::new(self.value, Script::clone(script)),
            self.height,
            self.is_coinbase,
            self.is_confiscation,
        ))
    }

    /// Turn this coin into the spent tombstone.
    pub fn clear(&mut self) {
        *self = Self::spent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_coin() -> CoinWithScript {
        CoinWithScript::new(TxOut::new(5_000, Script::new(vec![0x76, 0xa9, 0x14])), 10, false, false)
    }

    #[test]
    fn owning_conversion_keeps_metadata() {
        let coin = CoinImpl::from_coin_with_script(full_coin());
        assert!(coin.has_script());
        assert!(coin.is_storage_owner());
        assert_eq!(coin.owned_script_bytes(), 3);
        assert_eq!(coin.make_owning(), Some(full_coin()));
    }

    #[test]
    fn non_owning_handle_shares_script_without_accounting() {
        let coin = CoinImpl::from_coin_with_script(full_coin());
        let handle = coin.make_non_owning();
        assert!(handle.has_script());
        assert!(!handle.is_storage_owner());
        assert_eq!(handle.owned_script_bytes(), 0);
        assert_eq!(handle.script_size(), 3);
        assert_eq!(handle.make_owning(), Some(full_coin()));
    }

    #[test]
    fn shell_cannot_produce_owning_copy() {
        let shell = CoinImpl::from_coin_with_script(full_coin()).to_shell();
        assert!(!shell.has_script());
        assert!(shell.is_storage_owner());
        assert_eq!(shell.script_size(), 3);
        assert_eq!(shell.make_owning(), None);
        assert_eq!(shell.to_coin(), full_coin().to_coin());
    }

    #[test]
    fn spent_coin_is_a_tombstone() {
        let mut coin = CoinImpl::from_coin_with_script(full_coin());
        coin.clear();
        assert!(coin.is_spent());
        assert_eq!(coin.value(), 0);
        assert_eq!(coin.owned_script_bytes(), 0);
        assert!(coin.to_coin().is_spent());
        assert_eq!(coin.make_owning(), Some(CoinWithScript::spent()));
    }

    #[test]
    fn spent_full_coin_converts_to_spent_impl() {
        let coin = CoinImpl::from_coin_with_script(CoinWithScript::spent());
        assert_eq!(coin, CoinImpl::spent());
    }

    #[test]
    fn coin_view_reports_flags() {
        let coin = CoinWithScript::new(TxOut::new(1, Script::default()), 7, true, true).to_coin();
        assert!(coin.is_coinbase());
        assert!(coin.is_confiscation());
        assert_eq!(coin.height(), 7);
        assert!(!coin.is_spent());
    }
}

//! # coinstate-core
//! Coin model, layered copy-on-write coin caches and block undo for the
//! coinstate UTXO engine.

pub mod cancellation;
pub mod coin;
pub mod coins_cache;
pub mod coins_store;
pub mod constants;
pub mod error;
pub mod memory_view;
pub mod memusage;
pub mod traits;
pub mod types;
pub mod undo;

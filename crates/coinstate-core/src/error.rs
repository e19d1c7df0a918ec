//! Error types for the coin cache.
//!
//! Variants marked as logic errors mean the cache invariants have already
//! been broken by the caller or by a cache bug. They are returned rather than
//! swallowed so the node can stop before persisting inconsistent state.
use thiserror::Error;

use crate::types::OutPoint;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoinsError {
    /// Logic error: an unspent coin would be replaced without permission.
    #[error("adding new coin that replaces non-pruned entry: {0}")] OverwriteUnspent(OutPoint),
    /// Logic error: a child entry claims the parent knows nothing about an outpoint the parent holds unspent.
    #[error("FRESH flag misapplied to cache entry with spendable output: {0}")] FreshMisapplied(OutPoint),
    #[error("backing store: {0}")] Backend(String),
    #[error("serialization: {0}")] Serialization(String),
    #[error("input value overflow")] ValueOverflow,
    #[error("operation cancelled")] Cancelled,
}

impl CoinsError {
    /// Whether this error reports a broken cache invariant rather than an environmental failure.
    pub fn is_logic_error(&self) -> bool {
        matches!(self, Self::OverwriteUnspent(_) | Self::FreshMisapplied(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logic_error_classification() {
        assert!(CoinsError::OverwriteUnspent(OutPoint::null()).is_logic_error());
        assert!(CoinsError::FreshMisapplied(OutPoint::null()).is_logic_error());
        assert!(!CoinsError::Backend("io".into()).is_logic_error());
        assert!(!CoinsError::Cancelled.is_logic_error());
    }

    #[test]
    fn messages_name_the_outpoint() {
        let msg = CoinsError::OverwriteUnspent(OutPoint::null()).to_string();
        assert!(msg.contains("non-pruned"));
        assert!(msg.ends_with(&format!(":{}", u32::MAX)));
    }
}

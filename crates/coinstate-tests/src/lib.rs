//! Property and scenario tests spanning the coin cache hierarchy and the
//! block file store.
//!
//! The tests live under `tests/`; [`helpers`] builds the coins,
//! transactions and blocks they share.

pub mod helpers;

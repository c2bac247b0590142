//! # sbtc-primitives
//!
//! Core chain primitives shared by every other crate:
//! - Transactions, scripts and blocks with consensus wire encoding
//! - Double-SHA256 identifiers, merkle and witness-merkle roots
//! - Weight, virtual-size, legacy-sigop and fee-rate arithmetic

mod block;
mod encode;
mod feerate;
mod hash;
pub mod script;
mod transaction;

pub use block::{Block, BlockHeader};
pub use feerate::FeeRate;
pub use hash::{double_sha256, Hash256, HashError};
pub use script::Script;
pub use transaction::{OutPoint, Transaction, TxIn, TxOut, SEQUENCE_FINAL};

/// Monetary amount in satoshis.
pub type Amount = i64;

/// Satoshis per coin.
pub const COIN: Amount = 100_000_000;

/// Absolute cap on issued money.
pub const MAX_MONEY: Amount = 21_000_000 * COIN;

/// Scale factor between base size and weight.
pub const WITNESS_SCALE_FACTOR: u64 = 4;

/// Maximum block weight.
pub const MAX_BLOCK_WEIGHT: u64 = 4_000_000;

/// Maximum weighted signature-operation cost per block.
pub const MAX_BLOCK_SIGOPS_COST: i64 = 80_000;

/// Lock-time values at or above this threshold are unix timestamps,
/// below it they are block heights.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

//! # sbtc-mining
//!
//! Block template assembly for the contract-enabled chain.
//!
//! This crate provides:
//! - Ancestor-feerate package selection over the pool's dependency DAG
//! - Resource accounting against weight, sigop and gas budgets
//! - Speculative contract admission with state-root rollback
//! - Coinbase and proof-transaction construction, witness commitment
//! - Extra-nonce support for the mining driver

mod assembler;
mod error;
mod extranonce;
mod options;
mod overlay;
mod resources;
mod template;

pub use assembler::{BlockAssembler, LAST_BLOCK_TX, LAST_BLOCK_WEIGHT};
pub use error::{MiningError, MiningResult};
pub use extranonce::{coinbase_flags, increment_extra_nonce, ExtraNonceCounter};
pub use options::{AssemblerOptions, DEFAULT_BLOCK_MAX_WEIGHT, DEFAULT_BLOCK_MIN_TX_FEE};
pub use overlay::{ModifiedEntry, ModifiedTxSet};
pub use resources::{BlockResources, COINBASE_SIGOPS_RESERVATION, COINBASE_WEIGHT_RESERVATION};
pub use template::{
    generate_coinbase_commitment, update_time, witness_commitment_index, BlockTemplate,
};

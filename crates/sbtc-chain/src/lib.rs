//! # sbtc-chain
//!
//! Chain state the assembler consumes:
//! - Consensus parameters and fork activation predicates
//! - In-memory header index with tip and median-time-past
//! - Subsidy schedule and difficulty retargeting
//! - Structural block validity testing

mod chain;
mod error;
mod params;

pub use chain::{BlockIndex, Chain};
pub use error::{ChainError, ChainResult};
pub use params::{
    ConsensusParams, DEFAULT_STATE_ROOT, DEFAULT_UTXO_ROOT, VERSIONBITS_TOP_BITS,
};

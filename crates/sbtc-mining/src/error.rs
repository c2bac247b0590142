//! Mining error types.

use thiserror::Error;

/// Mining errors. Everything recoverable is absorbed inside the
/// selection loop; only these surface to the caller.
#[derive(Error, Debug)]
pub enum MiningError {
    /// The finished template failed the chain's validity test.
    #[error("block validity test failed: {0}")]
    BlockValidity(String),

    /// Chain error.
    #[error("chain error: {0}")]
    Chain(#[from] sbtc_chain::ChainError),
}

/// Result type for mining operations.
pub type MiningResult<T> = Result<T, MiningError>;

//! Chain error types.

use thiserror::Error;

/// Chain errors.
#[derive(Error, Debug)]
pub enum ChainError {
    /// A candidate block failed the validity test.
    #[error("block validity: {0}")]
    BlockValidity(String),

    /// Height beyond the active chain.
    #[error("unknown height {0}")]
    UnknownHeight(u32),
}

/// Result type for chain operations.
pub type ChainResult<T> = Result<T, ChainError>;

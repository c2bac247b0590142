//! Error types for the mempool.

use thiserror::Error;

/// Mempool errors.
#[derive(Error, Debug)]
pub enum MempoolError {
    /// Transaction already exists in the pool.
    #[error("transaction already in mempool: {0}")]
    AlreadyExists(String),

    /// An input is already spent by a pooled transaction.
    #[error("double spend detected: outpoint {0} already spent")]
    DoubleSpend(String),

    /// Transaction not found.
    #[error("transaction not found: {0}")]
    NotFound(String),
}

/// Result type for mempool operations.
pub type MempoolResult<T> = Result<T, MempoolError>;

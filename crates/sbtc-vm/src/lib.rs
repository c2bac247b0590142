//! # sbtc-vm
//!
//! Interface to the embedded contract engine. The assembler drives it
//! speculatively: snapshot the roots, run a transaction, and either
//! keep the mutated state or restore the snapshot.

use sbtc_primitives::{Amount, Hash256, Transaction, TxOut};
use thiserror::Error;

/// Contract execution errors.
#[derive(Error, Debug)]
pub enum VmError {
    /// The engine refused to execute the transaction.
    #[error("execution refused: {0}")]
    Refused(String),

    /// Gas price below the accepted minimum.
    #[error("gas price {offered} below minimum {minimum}")]
    GasPriceTooLow { offered: u64, minimum: u64 },

    /// Transaction gas limit above the per-transaction ceiling.
    #[error("gas limit {requested} above ceiling {ceiling}")]
    GasLimitTooHigh { requested: u64, ceiling: u64 },
}

/// Result type for contract execution.
pub type VmResult<T> = Result<T, VmError>;

/// Gas pricing and limits resolved once per block template.
#[derive(Debug, Clone, Copy, Default)]
pub struct GasSchedule {
    /// Floor on accepted gas price.
    pub min_gas_price: u64,
    /// Consensus gas ceiling per block.
    pub hard_block_gas_limit: u64,
    /// Operator gas ceiling per block, at most the hard limit.
    pub soft_block_gas_limit: u64,
    /// Gas ceiling per transaction.
    pub tx_gas_limit: u64,
}

/// Outcome of executing contract transactions. Used both for a single
/// speculative run and as the running accumulator across a block.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    /// Gas consumed.
    pub used_gas: u64,
    /// Gas refunded to senders.
    pub refund_sender: Amount,
    /// Refund outputs to append to the proof transaction.
    pub refund_outputs: Vec<TxOut>,
    /// Value-transfer transactions emitted by contract execution.
    pub value_transfers: Vec<Transaction>,
}

/// The contract engine the assembler drives.
///
/// Implementations must make `update_state` a faithful rollback: after
/// restoring a snapshot taken before `run_contract_tx`, the observable
/// roots equal the snapshot exactly.
pub trait ContractEngine: Send + Sync {
    /// Current (state root, UTXO root).
    fn state(&self) -> (Hash256, Hash256);

    /// Overwrite the roots, used to roll back speculative execution.
    fn update_state(&self, state_root: Hash256, utxo_root: Hash256);

    /// Minimum gas price the engine accepts at `height`.
    fn min_gas_price(&self, height: u32) -> u64;

    /// Consensus block gas limit at `height`.
    fn block_gas_limit(&self, height: u32) -> u64;

    /// Execute the contract outputs of `tx` against current state.
    /// `used_gas` is the gas already consumed by earlier transactions
    /// in the block under assembly. On success the engine's roots
    /// reflect the execution.
    fn run_contract_tx(
        &self,
        tx: &Transaction,
        schedule: &GasSchedule,
        used_gas: u64,
    ) -> VmResult<ExecResult>;
}

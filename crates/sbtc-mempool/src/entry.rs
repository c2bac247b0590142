//! Pool entries and their stable handles.

use crate::ordering::PackageScore;
use sbtc_primitives::{Amount, Hash256, Transaction};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Stable arena index of a pooled transaction. Handles stay valid for
/// the lifetime of the entry and are never reused while it is live.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct TxHandle(usize);

impl TxHandle {
    pub(crate) fn new(index: usize) -> Self {
        TxHandle(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

/// A transaction in the pool with its ancestor-aggregate state.
#[derive(Debug, Clone)]
pub struct TxEntry {
    pub txid: Hash256,
    pub tx: Arc<Transaction>,
    /// Fee actually paid.
    pub fee: Amount,
    /// Operator prioritisation delta applied on top of `fee`.
    pub fee_delta: Amount,
    /// Virtual size in bytes.
    pub tx_size: u64,
    pub weight: u64,
    pub sigop_cost: i64,
    /// Gas price for contract transactions, zero otherwise.
    pub gas_price: u64,
    pub is_create_or_call: bool,
    /// Direct in-pool parents.
    pub parents: BTreeSet<TxHandle>,
    /// Direct in-pool children.
    pub children: BTreeSet<TxHandle>,
    /// Number of in-pool ancestors plus one.
    pub count_with_ancestors: u64,
    /// Virtual size of this entry plus all in-pool ancestors.
    pub size_with_ancestors: u64,
    /// Modified fees of this entry plus all in-pool ancestors.
    pub mod_fees_with_ancestors: Amount,
    /// Sigop cost of this entry plus all in-pool ancestors.
    pub sigop_cost_with_ancestors: i64,
}

impl TxEntry {
    /// Fee with the prioritisation delta applied.
    pub fn modified_fee(&self) -> Amount {
        self.fee + self.fee_delta
    }

    /// Score over the raw (unmodified) ancestor aggregates.
    pub fn package_score(&self) -> PackageScore {
        PackageScore {
            is_create_or_call: self.is_create_or_call,
            gas_price: self.gas_price,
            mod_fees_with_ancestors: self.mod_fees_with_ancestors,
            size_with_ancestors: self.size_with_ancestors,
            txid: self.txid,
        }
    }
}

//! Package ordering by ancestor score or gas price.
//!
//! Plain transactions rank by ancestor feerate. Contract transactions
//! rank after every plain transaction and among themselves by gas
//! price, so contract work never crowds out ordinary fee revenue.

use crate::TxHandle;
use sbtc_primitives::{Amount, Hash256};
use std::cmp::Ordering;

/// Snapshot of the fields the comparator reads, valid for both raw
/// mempool aggregates and overlay-adjusted aggregates.
#[derive(Debug, Clone)]
pub struct PackageScore {
    pub is_create_or_call: bool,
    pub gas_price: u64,
    pub mod_fees_with_ancestors: Amount,
    pub size_with_ancestors: u64,
    pub txid: Hash256,
}

impl PackageScore {
    /// Total priority order; `Less` sorts (and therefore selects)
    /// earlier. The txid breaks exact ties.
    pub fn cmp_priority(&self, other: &Self) -> Ordering {
        match self.class_and_rate_cmp(other) {
            Ordering::Equal => self.txid.cmp(&other.txid),
            ord => ord,
        }
    }

    /// Strictly higher-priority than `other`, ignoring the txid
    /// tie-break. This is the overlay-beats-mempool test.
    pub fn ranks_above(&self, other: &Self) -> bool {
        self.class_and_rate_cmp(other) == Ordering::Less
    }

    fn class_and_rate_cmp(&self, other: &Self) -> Ordering {
        if self.is_create_or_call != other.is_create_or_call {
            return if self.is_create_or_call {
                Ordering::Greater
            } else {
                Ordering::Less
            };
        }
        if self.is_create_or_call && self.gas_price != other.gas_price {
            return other.gas_price.cmp(&self.gas_price);
        }
        // Cross-multiplied ancestor feerate, higher first.
        let lhs = self.mod_fees_with_ancestors as i128 * other.size_with_ancestors as i128;
        let rhs = other.mod_fees_with_ancestors as i128 * self.size_with_ancestors as i128;
        rhs.cmp(&lhs)
    }
}

/// Ordered-index key: a score plus the handle it belongs to.
#[derive(Debug, Clone)]
pub struct ScoreKey {
    pub score: PackageScore,
    pub handle: TxHandle,
}

impl PartialEq for ScoreKey {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle && self.score.cmp_priority(&other.score) == Ordering::Equal
    }
}

impl Eq for ScoreKey {}

impl PartialOrd for ScoreKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoreKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.score.cmp_priority(&other.score) {
            Ordering::Equal => self.handle.cmp(&other.handle),
            ord => ord,
        }
    }
}

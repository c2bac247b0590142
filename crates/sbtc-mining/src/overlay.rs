//! Modified-entry overlay.
//!
//! When an ancestor is committed to the block, the ancestor aggregates
//! cached in the pool become stale for every remaining descendant.
//! Rather than mutate the pool, the selection engine keeps adjusted
//! copies here, indexed by the same score order as the pool itself.

use sbtc_mempool::ordering::ScoreKey;
use sbtc_mempool::{PackageScore, PoolInner, TxEntry, TxHandle};
use sbtc_primitives::Amount;
use std::collections::{BTreeSet, HashMap};

/// Adjusted ancestor aggregates for one pooled transaction. Exists iff
/// at least one ancestor of the base entry is in the block and the
/// base entry itself is not.
#[derive(Debug, Clone)]
pub struct ModifiedEntry {
    pub handle: TxHandle,
    pub size_with_ancestors: u64,
    pub mod_fees_with_ancestors: Amount,
    pub sigop_cost_with_ancestors: i64,
}

impl ModifiedEntry {
    fn from_base(base: &TxEntry, handle: TxHandle) -> Self {
        ModifiedEntry {
            handle,
            size_with_ancestors: base.size_with_ancestors,
            mod_fees_with_ancestors: base.mod_fees_with_ancestors,
            sigop_cost_with_ancestors: base.sigop_cost_with_ancestors,
        }
    }

    /// Score over the adjusted aggregates; class, gas price and txid
    /// still come from the base entry.
    pub fn score(&self, base: &TxEntry) -> PackageScore {
        PackageScore {
            is_create_or_call: base.is_create_or_call,
            gas_price: base.gas_price,
            mod_fees_with_ancestors: self.mod_fees_with_ancestors,
            size_with_ancestors: self.size_with_ancestors,
            txid: base.txid,
        }
    }
}

/// The overlay: entries keyed by handle plus a score index supporting
/// peek-best, erase-by-handle and decrease-on-inclusion in `O(log n)`.
#[derive(Default)]
pub struct ModifiedTxSet {
    entries: HashMap<TxHandle, ModifiedEntry>,
    index: BTreeSet<ScoreKey>,
}

impl ModifiedTxSet {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, handle: TxHandle) -> bool {
        self.entries.contains_key(&handle)
    }

    pub fn get(&self, handle: TxHandle) -> Option<&ModifiedEntry> {
        self.entries.get(&handle)
    }

    /// Handle of the best-scoring overlay entry.
    pub fn best(&self) -> Option<TxHandle> {
        self.index.iter().next().map(|key| key.handle)
    }

    /// Record that `included` (an ancestor of `handle`) joined the
    /// block: subtract its individual footprint, creating the overlay
    /// record from the base aggregates on first touch.
    pub fn subtract_ancestor(&mut self, handle: TxHandle, base: &TxEntry, included: &TxEntry) {
        let mut entry = match self.entries.remove(&handle) {
            Some(existing) => {
                self.index.remove(&ScoreKey {
                    score: existing.score(base),
                    handle,
                });
                existing
            }
            None => ModifiedEntry::from_base(base, handle),
        };
        entry.size_with_ancestors -= included.tx_size;
        entry.mod_fees_with_ancestors -= included.modified_fee();
        entry.sigop_cost_with_ancestors -= included.sigop_cost;
        self.index.insert(ScoreKey {
            score: entry.score(base),
            handle,
        });
        self.entries.insert(handle, entry);
    }

    /// Drop an overlay entry, if present.
    pub fn erase(&mut self, handle: TxHandle, pool: &PoolInner) -> bool {
        match self.entries.remove(&handle) {
            Some(entry) => {
                self.index.remove(&ScoreKey {
                    score: entry.score(pool.entry(handle)),
                    handle,
                });
                true
            }
            None => false,
        }
    }
}

//! Transaction pool implementation.

use crate::entry::{TxEntry, TxHandle};
use crate::ordering::ScoreKey;
use crate::{MempoolError, MempoolResult};
use dashmap::DashMap;
use parking_lot::{RwLock, RwLockReadGuard};
use sbtc_primitives::{Amount, Hash256, OutPoint, Transaction, WITNESS_SCALE_FACTOR};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Transaction mempool.
///
/// Entries live in an arena of slots addressed by [`TxHandle`]; the
/// interior sits behind one coarse lock that template assembly holds
/// for a whole pass (chain lock first, pool lock second).
pub struct Mempool {
    /// Txid to handle lookup.
    by_id: DashMap<Hash256, TxHandle>,
    /// Arena, links, aggregates and the score index.
    inner: RwLock<PoolInner>,
}

/// Pool interior. Exposed through [`Mempool::read`] so a selection
/// pass can query it repeatedly under one lock acquisition.
#[derive(Default)]
pub struct PoolInner {
    slots: Vec<Option<TxEntry>>,
    free: Vec<usize>,
    /// Outpoint to spending transaction, for double-spend rejection.
    spent: HashMap<OutPoint, TxHandle>,
    /// Entries ordered by ancestor score or gas price, best first.
    score_index: BTreeSet<ScoreKey>,
    live: usize,
}

impl Mempool {
    pub fn new() -> Self {
        Mempool {
            by_id: DashMap::new(),
            inner: RwLock::new(PoolInner::default()),
        }
    }

    /// Lock the interior for reading. The selection engine keeps this
    /// guard for an entire assembly pass.
    pub fn read(&self) -> RwLockReadGuard<'_, PoolInner> {
        self.inner.read()
    }

    /// Add a transaction. `fee` is the fee it pays; `gas_price` is
    /// only meaningful for contract transactions.
    pub fn add(&self, tx: Transaction, fee: Amount, gas_price: u64) -> MempoolResult<TxHandle> {
        let txid = tx.txid();
        if self.by_id.contains_key(&txid) {
            return Err(MempoolError::AlreadyExists(txid.to_hex()));
        }

        let mut inner = self.inner.write();
        for input in &tx.inputs {
            if inner.spent.contains_key(&input.prevout) {
                return Err(MempoolError::DoubleSpend(format!(
                    "{}:{}",
                    input.prevout.txid, input.prevout.vout
                )));
            }
        }

        let mut parents = BTreeSet::new();
        for input in &tx.inputs {
            if let Some(parent) = self.by_id.get(&input.prevout.txid) {
                parents.insert(*parent);
            }
        }
        let ancestors = inner.collect_ancestors(&parents);

        let tx_size = tx.virtual_size();
        let weight = tx.weight();
        let sigop_cost = tx.legacy_sigop_count() * WITNESS_SCALE_FACTOR as i64;
        let is_create_or_call = tx.has_create_or_call();
        let mut entry = TxEntry {
            txid,
            tx: Arc::new(tx),
            fee,
            fee_delta: 0,
            tx_size,
            weight,
            sigop_cost,
            gas_price: if is_create_or_call { gas_price } else { 0 },
            is_create_or_call,
            parents: parents.clone(),
            children: BTreeSet::new(),
            count_with_ancestors: ancestors.len() as u64 + 1,
            size_with_ancestors: tx_size,
            mod_fees_with_ancestors: fee,
            sigop_cost_with_ancestors: sigop_cost,
        };
        for &ancestor in &ancestors {
            let anc = inner.entry(ancestor);
            entry.size_with_ancestors += anc.tx_size;
            entry.mod_fees_with_ancestors += anc.modified_fee();
            entry.sigop_cost_with_ancestors += anc.sigop_cost;
        }

        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                inner.slots.push(None);
                inner.slots.len() - 1
            }
        };
        let handle = TxHandle::new(index);
        for &parent in &parents {
            inner.slot_mut(parent).children.insert(handle);
        }
        for input in &entry.tx.inputs {
            inner.spent.insert(input.prevout, handle);
        }
        inner.score_index.insert(ScoreKey {
            score: entry.package_score(),
            handle,
        });
        inner.slots[index] = Some(entry);
        inner.live += 1;
        self.by_id.insert(txid, handle);

        debug!(txid = %txid, count = inner.live, "transaction added to mempool");
        Ok(handle)
    }

    /// Remove a transaction. Descendants stay pooled with their
    /// aggregates adjusted; callers removing a confirmed block walk it
    /// in order, so ancestors always leave first.
    pub fn remove(&self, txid: &Hash256) -> MempoolResult<()> {
        let (_, handle) = self
            .by_id
            .remove(txid)
            .ok_or_else(|| MempoolError::NotFound(txid.to_hex()))?;
        let mut inner = self.inner.write();
        inner.remove_entry(handle);
        debug!(txid = %txid, count = inner.live, "transaction removed from mempool");
        Ok(())
    }

    /// Remove every transaction confirmed by a connected block.
    pub fn remove_confirmed(&self, txids: &[Hash256]) {
        for txid in txids {
            let _ = self.remove(txid);
        }
    }

    /// Apply a fee delta that only affects selection, not the fee the
    /// transaction actually pays.
    pub fn prioritise(&self, txid: &Hash256, delta: Amount) -> MempoolResult<()> {
        let handle = *self
            .by_id
            .get(txid)
            .ok_or_else(|| MempoolError::NotFound(txid.to_hex()))?;
        let mut inner = self.inner.write();
        let affected = inner.calculate_descendants(handle);
        for &descendant in &affected {
            let old_key = ScoreKey {
                score: inner.entry(descendant).package_score(),
                handle: descendant,
            };
            inner.score_index.remove(&old_key);
            let entry = inner.slot_mut(descendant);
            if descendant == handle {
                entry.fee_delta += delta;
            }
            entry.mod_fees_with_ancestors += delta;
            let new_key = ScoreKey {
                score: entry.package_score(),
                handle: descendant,
            };
            inner.score_index.insert(new_key);
        }
        debug!(txid = %txid, delta, "transaction prioritised");
        Ok(())
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.by_id.contains_key(txid)
    }

    pub fn handle(&self, txid: &Hash256) -> Option<TxHandle> {
        self.by_id.get(txid).map(|h| *h)
    }

    pub fn len(&self) -> usize {
        self.inner.read().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolInner {
    /// Entry behind a handle. A stale handle means the caller's
    /// bookkeeping is corrupt, which is unrecoverable.
    pub fn entry(&self, handle: TxHandle) -> &TxEntry {
        match self.slots.get(handle.index()).and_then(Option::as_ref) {
            Some(entry) => entry,
            None => panic!("stale mempool handle {:?}", handle),
        }
    }

    fn slot_mut(&mut self, handle: TxHandle) -> &mut TxEntry {
        match self.slots.get_mut(handle.index()).and_then(Option::as_mut) {
            Some(entry) => entry,
            None => panic!("stale mempool handle {:?}", handle),
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Handles ordered best-first by ancestor score or gas price.
    pub fn ancestor_score_order(&self) -> Vec<TxHandle> {
        self.score_index.iter().map(|key| key.handle).collect()
    }

    /// All in-pool ancestors of `handle`, excluding itself. Bounds are
    /// deliberately unlimited; the selection engine wants the full
    /// package.
    pub fn calculate_ancestors(&self, handle: TxHandle) -> BTreeSet<TxHandle> {
        self.collect_ancestors(&self.entry(handle).parents)
    }

    /// All in-pool descendants of `handle`, including itself.
    pub fn calculate_descendants(&self, handle: TxHandle) -> BTreeSet<TxHandle> {
        let mut descendants = BTreeSet::new();
        let mut stack = vec![handle];
        while let Some(current) = stack.pop() {
            if descendants.insert(current) {
                stack.extend(self.entry(current).children.iter().copied());
            }
        }
        descendants
    }

    fn collect_ancestors(&self, roots: &BTreeSet<TxHandle>) -> BTreeSet<TxHandle> {
        let mut ancestors = BTreeSet::new();
        let mut stack: Vec<TxHandle> = roots.iter().copied().collect();
        while let Some(current) = stack.pop() {
            if ancestors.insert(current) {
                stack.extend(self.entry(current).parents.iter().copied());
            }
        }
        ancestors
    }

    fn remove_entry(&mut self, handle: TxHandle) {
        let entry = match self.slots[handle.index()].take() {
            Some(entry) => entry,
            None => panic!("stale mempool handle {:?}", handle),
        };
        self.live -= 1;
        self.score_index.remove(&ScoreKey {
            score: entry.package_score(),
            handle,
        });
        for input in &entry.tx.inputs {
            self.spent.remove(&input.prevout);
        }
        for &parent in &entry.parents {
            self.slot_mut(parent).children.remove(&handle);
        }

        // Fix up every descendant's ancestor aggregates.
        let mut descendants = BTreeSet::new();
        let mut stack: Vec<TxHandle> = entry.children.iter().copied().collect();
        while let Some(current) = stack.pop() {
            if descendants.insert(current) {
                stack.extend(self.entry(current).children.iter().copied());
            }
        }
        for &descendant in &descendants {
            let old_key = ScoreKey {
                score: self.entry(descendant).package_score(),
                handle: descendant,
            };
            self.score_index.remove(&old_key);
            let dentry = self.slot_mut(descendant);
            dentry.parents.remove(&handle);
            dentry.count_with_ancestors -= 1;
            dentry.size_with_ancestors -= entry.tx_size;
            dentry.mod_fees_with_ancestors -= entry.modified_fee();
            dentry.sigop_cost_with_ancestors -= entry.sigop_cost;
            let new_key = ScoreKey {
                score: self.entry(descendant).package_score(),
                handle: descendant,
            };
            self.score_index.insert(new_key);
        }

        self.free.push(handle.index());
    }
}

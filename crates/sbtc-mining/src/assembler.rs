//! Block template assembly.
//!
//! Unconfirmed transactions often depend on other pooled transactions,
//! so selection scores each transaction together with all of its
//! unconfirmed ancestors. Entries are not removed from the pool as
//! they are selected; instead the stale ancestor state of their
//! descendants is tracked in a modified-entry overlay, and every
//! iteration compares the best overlay candidate against the next
//! entry in the pool's own score order.
//!
//! Contract transactions take a separate admission path: the engine
//! executes them speculatively against its state roots, and the roots
//! are restored whenever the result does not fit the block.

use crate::options::AssemblerOptions;
use crate::overlay::ModifiedTxSet;
use crate::resources::{BlockResources, COINBASE_WEIGHT_RESERVATION};
use crate::template::{generate_coinbase_commitment, update_time, BlockTemplate};
use crate::{MiningError, MiningResult};
use parking_lot::RwLock;
use sbtc_chain::{Chain, DEFAULT_STATE_ROOT, DEFAULT_UTXO_ROOT};
use sbtc_mempool::{Mempool, PoolInner, TxHandle};
use sbtc_primitives::script::opcodes::{OP_0, OP_VM_STATE};
use sbtc_primitives::{
    Amount, Block, FeeRate, Hash256, OutPoint, Script, Transaction, TxIn, TxOut, MAX_BLOCK_WEIGHT,
    WITNESS_SCALE_FACTOR,
};
use sbtc_vm::{ContractEngine, ExecResult, GasSchedule};
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Give up when this many consecutive packages failed the fit test
/// while the block is already near its weight ceiling.
const MAX_CONSECUTIVE_FAILURES: u32 = 1000;

/// Transaction count of the last assembled template, for telemetry.
pub static LAST_BLOCK_TX: AtomicU64 = AtomicU64::new(0);

/// Weight of the last assembled template, for telemetry.
pub static LAST_BLOCK_WEIGHT: AtomicU64 = AtomicU64::new(0);

/// Index of the proof transaction in a contract-enabled block.
const PROOF_TX_INDEX: usize = 1;

/// Assembles block templates from the chain tip and the pool.
pub struct BlockAssembler {
    chain: Arc<RwLock<Chain>>,
    mempool: Arc<Mempool>,
    engine: Arc<dyn ContractEngine>,
    options: AssemblerOptions,
    block_max_weight: u64,
    block_min_fee_rate: FeeRate,

    // Per-pass state, rebuilt by `reset_block`.
    block: Block,
    tx_fees: Vec<Amount>,
    tx_sigops_cost: Vec<i64>,
    resources: BlockResources,
    in_block: BTreeSet<TxHandle>,
    include_witness: bool,
    height: u32,
    lock_time_cutoff: i64,
    gas: GasSchedule,
    bce: ExecResult,
    original_reward_tx: Option<Transaction>,
}

impl BlockAssembler {
    pub fn new(
        chain: Arc<RwLock<Chain>>,
        mempool: Arc<Mempool>,
        engine: Arc<dyn ContractEngine>,
        options: AssemblerOptions,
    ) -> Self {
        // Clamp the weight budget so the reserved coinbase always fits
        // and the template never exceeds consensus.
        let block_max_weight = options.block_max_weight.clamp(
            COINBASE_WEIGHT_RESERVATION,
            MAX_BLOCK_WEIGHT - COINBASE_WEIGHT_RESERVATION,
        );
        let block_min_fee_rate = FeeRate::from_sat_per_kvb(options.block_min_tx_fee);
        BlockAssembler {
            chain,
            mempool,
            engine,
            options,
            block_max_weight,
            block_min_fee_rate,
            block: Block::default(),
            tx_fees: Vec::new(),
            tx_sigops_cost: Vec::new(),
            resources: BlockResources::default(),
            in_block: BTreeSet::new(),
            include_witness: false,
            height: 0,
            lock_time_cutoff: 0,
            gas: GasSchedule::default(),
            bce: ExecResult::default(),
            original_reward_tx: None,
        }
    }

    /// Effective weight budget after clamping.
    pub fn block_max_weight(&self) -> u64 {
        self.block_max_weight
    }

    fn reset_block(&mut self) {
        self.in_block.clear();
        self.resources.reset();
        self.include_witness = false;
        self.block = Block::default();
        self.tx_fees.clear();
        self.tx_sigops_cost.clear();
        self.bce = ExecResult::default();
        self.original_reward_tx = None;
    }

    /// Assemble a new block template paying `script_pub_key`.
    pub fn create_new_block(
        &mut self,
        script_pub_key: Script,
        mine_witness_tx: bool,
    ) -> MiningResult<BlockTemplate> {
        self.reset_block();

        // Chain lock first, pool lock second; both held for the pass.
        let chain_handle = Arc::clone(&self.chain);
        let chain = chain_handle.read();
        let mempool_handle = Arc::clone(&self.mempool);
        let pool = mempool_handle.read();

        let prev = chain.tip();
        self.height = prev.height + 1;

        let mut version = chain.compute_block_version(&prev);
        if chain.params().mine_blocks_on_demand {
            if let Some(override_version) = self.options.block_version {
                version = override_version;
            }
        }
        self.block.header.version = version;
        self.block.header.time = chain.adjusted_time() as u32;
        self.lock_time_cutoff = chain.median_time_past(prev.height);
        self.include_witness = chain.is_witness_enabled(&prev) && mine_witness_tx;

        LAST_BLOCK_TX.store(self.resources.block_tx, Ordering::Relaxed);
        LAST_BLOCK_WEIGHT.store(self.resources.block_weight, Ordering::Relaxed);

        // Coinbase placeholder. Its output value and template rows are
        // finalized once fees are known, in one deferred step.
        let mut coinbase_input = TxIn::new(OutPoint::null());
        coinbase_input.script_sig = Script::new()
            .push_num(self.height as i64)
            .push_opcode(OP_0);
        let coinbase = Transaction {
            version: 1,
            inputs: vec![coinbase_input],
            outputs: vec![TxOut {
                value: 0,
                script_pubkey: script_pub_key,
            }],
            lock_time: 0,
        };
        self.push_tx(coinbase, -1, -1);

        self.gas = self.resolve_gas_schedule(self.height);
        let (old_state_root, old_utxo_root) = self.engine.state();
        let enable_contract = chain.is_contract_fork_enabled(prev.height);

        if enable_contract {
            let display_state = if old_state_root.is_null() {
                DEFAULT_STATE_ROOT
            } else {
                old_state_root
            };
            let display_utxo = if old_utxo_root.is_null() {
                DEFAULT_UTXO_ROOT
            } else {
                old_utxo_root
            };
            let mut proof_input = TxIn::new(OutPoint::null());
            proof_input.script_sig = Script::new()
                .push_num(self.height as i64)
                .push_opcode(OP_0);
            let proof = Transaction {
                version: 1,
                inputs: vec![proof_input.clone(), proof_input],
                outputs: vec![TxOut {
                    value: 0,
                    script_pubkey: proof_script(&display_state, &display_utxo),
                }],
                lock_time: 0,
            };
            self.original_reward_tx = Some(proof.clone());
            let proof_sigops = proof.legacy_sigop_count();
            self.push_tx(proof, 0, proof_sigops);
        }

        let (packages_selected, descendants_updated) = self.add_package_txs(&pool);

        let (mut latest_state_root, mut latest_utxo_root) = self.engine.state();
        if self.height > chain.params().contract_fork_height {
            if latest_state_root.is_null() {
                latest_state_root = DEFAULT_STATE_ROOT;
            }
            if latest_utxo_root.is_null() {
                latest_utxo_root = DEFAULT_UTXO_ROOT;
            }
        }
        // The caller re-commits engine state when the block connects;
        // assembly leaves the cursor exactly where it found it.
        self.engine.update_state(old_state_root, old_utxo_root);

        if enable_contract {
            self.rebuild_refund_transaction(latest_state_root, latest_utxo_root);
        }

        self.block.transactions[0].outputs[0].value =
            self.resources.fees + chain.block_subsidy(self.height);

        let commitment = generate_coinbase_commitment(&mut self.block, chain.params());
        self.tx_fees[0] = -self.resources.fees;

        info!(
            weight = self.block.weight(),
            txs = self.resources.block_tx,
            fees = self.resources.fees,
            sigops = self.resources.block_sigops_cost,
            packages = packages_selected,
            updated_descendants = descendants_updated,
            "assembled block template"
        );

        self.block.header.hash_prev_block = prev.hash;
        update_time(&mut self.block.header, &chain, &prev);
        self.block.header.bits = chain.next_work_required(&prev, self.block.header.time as i64);
        self.block.header.nonce = 0;
        self.tx_sigops_cost[0] =
            WITNESS_SCALE_FACTOR as i64 * self.block.transactions[0].legacy_sigop_count();

        chain
            .test_block_validity(&self.block, &prev, false, false)
            .map_err(|err| MiningError::BlockValidity(err.to_string()))?;

        Ok(BlockTemplate {
            block: self.block.clone(),
            tx_fees: self.tx_fees.clone(),
            tx_sigops_cost: self.tx_sigops_cost.clone(),
            coinbase_commitment: commitment,
        })
    }

    /// One selection pass. Returns `(packages selected, descendant
    /// overlay updates)`.
    fn add_package_txs(&mut self, pool: &PoolInner) -> (u32, u32) {
        let mut modified = ModifiedTxSet::default();
        let mut failed: HashSet<TxHandle> = HashSet::new();
        let mut packages_selected = 0u32;
        let mut descendants_updated = 0u32;

        // Seed the overlay from anything already committed.
        let seeded = self.in_block.clone();
        descendants_updated += update_packages_for_added(pool, &seeded, &mut modified);

        let order = pool.ancestor_score_order();
        let mut mi = 0usize;
        let mut consecutive_failures = 0u32;

        while mi < order.len() || !modified.is_empty() {
            if mi < order.len() {
                let candidate = order[mi];
                // Skip pool entries whose cached state is stale:
                // already selected, overlaid, or known to fail.
                if self.in_block.contains(&candidate)
                    || modified.contains(candidate)
                    || failed.contains(&candidate)
                {
                    mi += 1;
                    continue;
                }
            }

            // Pick the higher-scoring of the two streams.
            let mut using_modified = false;
            let handle;
            let (package_size, package_fees, package_sigops);
            if mi >= order.len() {
                let best = match modified.best() {
                    Some(best) => best,
                    None => break,
                };
                let entry = match modified.get(best) {
                    Some(entry) => entry.clone(),
                    None => break,
                };
                handle = best;
                using_modified = true;
                package_size = entry.size_with_ancestors;
                package_fees = entry.mod_fees_with_ancestors;
                package_sigops = entry.sigop_cost_with_ancestors;
            } else {
                let pool_candidate = order[mi];
                let overlay_best = modified
                    .best()
                    .and_then(|best| modified.get(best).map(|entry| (best, entry.clone())));
                match overlay_best {
                    Some((best, entry))
                        if entry
                            .score(pool.entry(best))
                            .ranks_above(&pool.entry(pool_candidate).package_score()) =>
                    {
                        handle = best;
                        using_modified = true;
                        package_size = entry.size_with_ancestors;
                        package_fees = entry.mod_fees_with_ancestors;
                        package_sigops = entry.sigop_cost_with_ancestors;
                    }
                    _ => {
                        handle = pool_candidate;
                        mi += 1;
                        let entry = pool.entry(handle);
                        package_size = entry.size_with_ancestors;
                        package_fees = entry.mod_fees_with_ancestors;
                        package_sigops = entry.sigop_cost_with_ancestors;
                    }
                }
            }

            assert!(
                !self.in_block.contains(&handle),
                "selected an entry already in the block"
            );

            if package_fees < self.block_min_fee_rate.fee(package_size) {
                // Both streams are score-ordered: everything else we
                // might consider pays an even lower rate.
                return (packages_selected, descendants_updated);
            }

            if !self
                .resources
                .fits(self.block_max_weight, package_size, package_sigops)
            {
                if using_modified {
                    // The overlay always surfaces its best entry, so a
                    // failed one must be erased to reach the next.
                    modified.erase(handle, pool);
                    failed.insert(handle);
                }
                consecutive_failures += 1;
                if consecutive_failures > MAX_CONSECUTIVE_FAILURES
                    && self.resources.block_weight
                        > self.block_max_weight - COINBASE_WEIGHT_RESERVATION
                {
                    // Near-full and nothing fits; stop trying.
                    break;
                }
                continue;
            }

            let mut package = pool.calculate_ancestors(handle);
            self.only_unconfirmed(&mut package);
            package.insert(handle);

            if !self.test_package_transactions(pool, &package) {
                if using_modified {
                    modified.erase(handle, pool);
                    failed.insert(handle);
                }
                continue;
            }

            // This package will make it in; the block is not stuck.
            consecutive_failures = 0;

            let sorted = sort_for_block(pool, &package);
            let mut was_added = true;
            for &member in &sorted {
                if !was_added {
                    // An earlier member failed; the rest of the package
                    // is unusable.
                    modified.erase(member, pool);
                    continue;
                }
                if pool.entry(member).is_create_or_call {
                    was_added = self.attempt_to_add_contract(pool, member);
                    if !was_added && using_modified {
                        modified.erase(handle, pool);
                        failed.insert(handle);
                    }
                } else {
                    self.add_to_block(pool, member);
                }
                modified.erase(member, pool);
            }

            if !was_added {
                continue;
            }

            packages_selected += 1;
            descendants_updated += update_packages_for_added(pool, &package, &mut modified);
        }

        (packages_selected, descendants_updated)
    }

    /// Admission path for contract transactions: execute speculatively,
    /// commit only if every budget still holds.
    fn attempt_to_add_contract(&mut self, pool: &PoolInner, handle: TxHandle) -> bool {
        let entry = pool.entry(handle);
        // No proof transaction slot exists before the fork activates.
        if self.original_reward_tx.is_none() {
            debug!(txid = %entry.txid, "contract transaction before fork activation");
            return false;
        }
        let (old_state_root, old_utxo_root) = self.engine.state();

        // Shadow counters; applied to the block only on success.
        let mut local_weight = self.resources.block_weight + entry.weight;
        let mut local_sigops = self.resources.block_sigops_cost + entry.sigop_cost;

        let exec = match self
            .engine
            .run_contract_tx(&entry.tx, &self.gas, self.bce.used_gas)
        {
            Ok(result) => result,
            Err(err) => {
                debug!(txid = %entry.txid, %err, "contract execution refused");
                self.engine.update_state(old_state_root, old_utxo_root);
                return false;
            }
        };

        if self.bce.used_gas + exec.used_gas > self.gas.soft_block_gas_limit {
            debug!(txid = %entry.txid, used = exec.used_gas, "soft block gas limit saturated");
            self.engine.update_state(old_state_root, old_utxo_root);
            return false;
        }

        for transfer in &exec.value_transfers {
            local_weight += transfer.weight();
            local_sigops += transfer.legacy_sigop_count();
        }

        // Swap the current proof transaction's sigops for those of the
        // speculatively extended one.
        local_sigops -= self.block.transactions[PROOF_TX_INDEX].legacy_sigop_count();
        let mut speculative_proof = self.block.transactions[PROOF_TX_INDEX].clone();
        speculative_proof
            .outputs
            .extend(exec.refund_outputs.iter().cloned());
        local_sigops += speculative_proof.legacy_sigop_count();

        if !BlockResources::final_fits(local_weight, local_sigops) {
            debug!(txid = %entry.txid, "contract execution would overflow block limits");
            self.engine.update_state(old_state_root, old_utxo_root);
            return false;
        }

        // Commit: fold the execution into the accumulator and the block.
        let gas_refunds: Amount = exec.refund_outputs.iter().map(|out| out.value).sum();
        self.bce.used_gas += exec.used_gas;
        self.bce.refund_sender += exec.refund_sender;
        self.bce.refund_outputs.extend(exec.refund_outputs);
        self.bce.value_transfers = exec.value_transfers;

        self.push_tx((*entry.tx).clone(), entry.fee, entry.sigop_cost);
        self.resources.block_weight += entry.weight;
        self.resources.block_tx += 1;
        self.resources.block_sigops_cost += entry.sigop_cost;
        // Refunds come out of this transaction's own fee.
        self.resources.fees += entry.fee - gas_refunds;
        self.in_block.insert(handle);

        let transfers = std::mem::take(&mut self.bce.value_transfers);
        for transfer in transfers {
            let weight = transfer.weight();
            let sigops = transfer.legacy_sigop_count();
            self.push_tx(transfer, 0, sigops);
            self.resources.block_weight += weight;
            self.resources.block_sigops_cost += sigops;
            self.resources.block_tx += 1;
        }

        // Rebuild the proof transaction with the accumulated refunds
        // and account the sigop delta.
        self.resources.block_sigops_cost -=
            self.block.transactions[PROOF_TX_INDEX].legacy_sigop_count();
        self.rebuild_refund_transaction(Hash256::ZERO, Hash256::ZERO);
        self.resources.block_sigops_cost +=
            self.block.transactions[PROOF_TX_INDEX].legacy_sigop_count();

        true
    }

    /// Append a pool entry to the block.
    fn add_to_block(&mut self, pool: &PoolInner, handle: TxHandle) {
        let entry = pool.entry(handle);
        self.push_tx((*entry.tx).clone(), entry.fee, entry.sigop_cost);
        self.resources.block_weight += entry.weight;
        self.resources.block_tx += 1;
        self.resources.block_sigops_cost += entry.sigop_cost;
        self.resources.fees += entry.fee;
        self.in_block.insert(handle);

        if self.options.print_priority {
            debug!(
                fee_rate = %FeeRate::from_fee(entry.modified_fee(), entry.tx_size),
                txid = %entry.txid,
                "added transaction to block template"
            );
        }
    }

    /// Rebuild the proof transaction from its original form plus every
    /// accumulated refund output. Null roots keep the existing root
    /// commitment script.
    fn rebuild_refund_transaction(&mut self, state_root: Hash256, utxo_root: Hash256) {
        let original = match &self.original_reward_tx {
            Some(tx) => tx.clone(),
            None => return,
        };
        let mut proof = original;
        if !(state_root.is_null() || utxo_root.is_null()) {
            proof.outputs[0].script_pubkey = proof_script(&state_root, &utxo_root);
            proof.outputs[0].value = 0;
        }
        proof
            .outputs
            .extend(self.bce.refund_outputs.iter().cloned());
        let sigops = proof.legacy_sigop_count();
        self.block.transactions[PROOF_TX_INDEX] = proof;
        self.tx_sigops_cost[PROOF_TX_INDEX] = sigops;
    }

    /// Drop package members already committed to the block.
    fn only_unconfirmed(&self, package: &mut BTreeSet<TxHandle>) {
        package.retain(|member| !self.in_block.contains(member));
    }

    /// Finality and witness policy over a whole package.
    fn test_package_transactions(&self, pool: &PoolInner, package: &BTreeSet<TxHandle>) -> bool {
        for &member in package {
            let entry = pool.entry(member);
            if !entry.tx.is_final(self.height, self.lock_time_cutoff) {
                return false;
            }
            if !self.include_witness && entry.tx.has_witness() {
                return false;
            }
        }
        true
    }

    fn push_tx(&mut self, tx: Transaction, fee: Amount, sigops: i64) {
        self.block.transactions.push(tx);
        self.tx_fees.push(fee);
        self.tx_sigops_cost.push(sigops);
    }

    /// Resolve the gas tuple for this template from the engine's view
    /// plus operator overrides.
    fn resolve_gas_schedule(&self, height: u32) -> GasSchedule {
        let mut min_gas_price = self.engine.min_gas_price(height);
        if let Some(floor) = self.options.min_tx_gas_price {
            min_gas_price = min_gas_price.max(floor);
        }
        let hard_block_gas_limit = self.engine.block_gas_limit(height);
        let soft_block_gas_limit = self
            .options
            .soft_block_gas_limit
            .unwrap_or(hard_block_gas_limit)
            .min(hard_block_gas_limit);
        let tx_gas_limit = self
            .options
            .max_tx_gas_limit
            .unwrap_or(soft_block_gas_limit);
        GasSchedule {
            min_gas_price,
            hard_block_gas_limit,
            soft_block_gas_limit,
            tx_gas_limit,
        }
    }
}

/// Root commitment script of a proof transaction.
fn proof_script(state_root: &Hash256, utxo_root: &Hash256) -> Script {
    Script::new()
        .push_slice(state_root.as_bytes())
        .push_slice(utxo_root.as_bytes())
        .push_opcode(OP_VM_STATE)
}

/// Sort a package by ancestor count. A child always counts more
/// ancestors than any of its parents, so ascending count is a valid
/// inclusion order.
fn sort_for_block(pool: &PoolInner, package: &BTreeSet<TxHandle>) -> Vec<TxHandle> {
    let mut sorted: Vec<TxHandle> = package.iter().copied().collect();
    sorted.sort_by_key(|&member| (pool.entry(member).count_with_ancestors, member));
    sorted
}

/// Walk the descendants of each newly included entry and patch their
/// overlay aggregates. Returns the number of updates applied.
fn update_packages_for_added(
    pool: &PoolInner,
    added: &BTreeSet<TxHandle>,
    modified: &mut ModifiedTxSet,
) -> u32 {
    let mut updated = 0;
    for &included in added {
        let included_entry = pool.entry(included);
        for descendant in pool.calculate_descendants(included) {
            if added.contains(&descendant) {
                continue;
            }
            updated += 1;
            modified.subtract_ancestor(descendant, pool.entry(descendant), included_entry);
        }
    }
    updated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::DEFAULT_BLOCK_MAX_WEIGHT;
    use sbtc_chain::ConsensusParams;
    use sbtc_vm::VmResult;

    struct NullEngine;

    impl ContractEngine for NullEngine {
        fn state(&self) -> (Hash256, Hash256) {
            (Hash256::ZERO, Hash256::ZERO)
        }
        fn update_state(&self, _state_root: Hash256, _utxo_root: Hash256) {}
        fn min_gas_price(&self, _height: u32) -> u64 {
            40
        }
        fn block_gas_limit(&self, _height: u32) -> u64 {
            40_000_000
        }
        fn run_contract_tx(
            &self,
            _tx: &Transaction,
            _schedule: &GasSchedule,
            _used_gas: u64,
        ) -> VmResult<ExecResult> {
            Ok(ExecResult::default())
        }
    }

    fn assembler_with(options: AssemblerOptions) -> BlockAssembler {
        BlockAssembler::new(
            Arc::new(RwLock::new(Chain::new(ConsensusParams::mainnet()))),
            Arc::new(Mempool::new()),
            Arc::new(NullEngine),
            options,
        )
    }

    #[test]
    fn test_weight_budget_is_clamped() {
        let tiny = assembler_with(AssemblerOptions {
            block_max_weight: 1,
            ..Default::default()
        });
        assert_eq!(tiny.block_max_weight(), 4000);

        let huge = assembler_with(AssemblerOptions {
            block_max_weight: u64::MAX,
            ..Default::default()
        });
        assert_eq!(huge.block_max_weight(), MAX_BLOCK_WEIGHT - 4000);

        let default = assembler_with(AssemblerOptions::default());
        assert_eq!(default.block_max_weight(), DEFAULT_BLOCK_MAX_WEIGHT);
    }

    #[test]
    fn test_gas_schedule_resolution() {
        let assembler = assembler_with(AssemblerOptions {
            min_tx_gas_price: Some(100),
            soft_block_gas_limit: Some(90_000_000), // above hard: clamped
            ..Default::default()
        });
        let schedule = assembler.resolve_gas_schedule(1);
        assert_eq!(schedule.min_gas_price, 100);
        assert_eq!(schedule.hard_block_gas_limit, 40_000_000);
        assert_eq!(schedule.soft_block_gas_limit, 40_000_000);
        assert_eq!(schedule.tx_gas_limit, 40_000_000);

        // Engine minimum wins over a lower operator floor
        let assembler = assembler_with(AssemblerOptions {
            min_tx_gas_price: Some(1),
            soft_block_gas_limit: Some(10_000_000),
            max_tx_gas_limit: Some(2_000_000),
            ..Default::default()
        });
        let schedule = assembler.resolve_gas_schedule(1);
        assert_eq!(schedule.min_gas_price, 40);
        assert_eq!(schedule.soft_block_gas_limit, 10_000_000);
        assert_eq!(schedule.tx_gas_limit, 2_000_000);
    }

    #[test]
    fn test_proof_script_layout() {
        let script = proof_script(&DEFAULT_STATE_ROOT, &DEFAULT_UTXO_ROOT);
        // two 32-byte pushes plus the trailing opcode
        assert_eq!(script.len(), 33 + 33 + 1);
        assert!(script.contains_op(OP_VM_STATE));
    }
}

//! Test harness: in-memory chain, scripted contract engine and
//! transaction factories shared by the integration tests.

use parking_lot::{Mutex, RwLock};
use sbtc_chain::{Chain, ConsensusParams};
use sbtc_mempool::Mempool;
use sbtc_mining::{AssemblerOptions, BlockAssembler};
use sbtc_primitives::script::opcodes::{OP_CALL, OP_CHECKSIG};
use sbtc_primitives::{
    double_sha256, Amount, Block, Hash256, OutPoint, Script, Transaction, TxIn, TxOut,
};
use sbtc_vm::{ContractEngine, ExecResult, GasSchedule, VmError, VmResult};
use std::collections::HashMap;
use std::sync::Arc;

/// Deterministic wall clock for every test chain.
pub const TEST_TIME: i64 = 1_600_000_000;

/// Scripted behavior for one contract transaction.
#[derive(Clone)]
pub enum ContractOutcome {
    /// Execute successfully with the given result.
    Succeed {
        used_gas: u64,
        refund_sender: Amount,
        refund_outputs: Vec<TxOut>,
        value_transfers: Vec<Transaction>,
    },
    /// Refuse after dirtying the roots, as an engine failing mid-write
    /// would.
    Refuse,
}

impl ContractOutcome {
    /// Plain successful execution burning `used_gas`.
    pub fn burn(used_gas: u64) -> Self {
        ContractOutcome::Succeed {
            used_gas,
            refund_sender: 0,
            refund_outputs: Vec::new(),
            value_transfers: Vec::new(),
        }
    }
}

/// Contract engine with scripted per-transaction outcomes. Successful
/// executions fold the txid into both roots so tests can verify which
/// executions survived rollback.
pub struct MockEngine {
    roots: Mutex<(Hash256, Hash256)>,
    outcomes: Mutex<HashMap<Hash256, ContractOutcome>>,
    min_gas_price: u64,
    block_gas_limit: u64,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::with_roots(double_sha256(b"state-0"), double_sha256(b"utxo-0"))
    }

    pub fn with_roots(state_root: Hash256, utxo_root: Hash256) -> Self {
        MockEngine {
            roots: Mutex::new((state_root, utxo_root)),
            outcomes: Mutex::new(HashMap::new()),
            min_gas_price: 40,
            block_gas_limit: 40_000_000,
        }
    }

    /// Script the outcome for `txid`. Unscripted transactions refuse.
    pub fn script(&self, txid: Hash256, outcome: ContractOutcome) {
        self.outcomes.lock().insert(txid, outcome);
    }

    pub fn roots(&self) -> (Hash256, Hash256) {
        *self.roots.lock()
    }

    /// The roots a successful execution of `txid` produces on top of
    /// `(state, utxo)`.
    pub fn roots_after(state: Hash256, utxo: Hash256, txid: Hash256) -> (Hash256, Hash256) {
        let mut seed = state.0.to_vec();
        seed.extend_from_slice(&txid.0);
        let new_state = double_sha256(&seed);
        let mut seed = utxo.0.to_vec();
        seed.extend_from_slice(&txid.0);
        (new_state, double_sha256(&seed))
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ContractEngine for MockEngine {
    fn state(&self) -> (Hash256, Hash256) {
        *self.roots.lock()
    }

    fn update_state(&self, state_root: Hash256, utxo_root: Hash256) {
        *self.roots.lock() = (state_root, utxo_root);
    }

    fn min_gas_price(&self, _height: u32) -> u64 {
        self.min_gas_price
    }

    fn block_gas_limit(&self, _height: u32) -> u64 {
        self.block_gas_limit
    }

    fn run_contract_tx(
        &self,
        tx: &Transaction,
        _schedule: &GasSchedule,
        _used_gas: u64,
    ) -> VmResult<ExecResult> {
        let txid = tx.txid();
        let outcome = self
            .outcomes
            .lock()
            .get(&txid)
            .cloned()
            .unwrap_or(ContractOutcome::Refuse);
        match outcome {
            ContractOutcome::Succeed {
                used_gas,
                refund_sender,
                refund_outputs,
                value_transfers,
            } => {
                let (state, utxo) = *self.roots.lock();
                *self.roots.lock() = Self::roots_after(state, utxo, txid);
                Ok(ExecResult {
                    used_gas,
                    refund_sender,
                    refund_outputs,
                    value_transfers,
                })
            }
            ContractOutcome::Refuse => {
                // Leave garbage behind; the assembler must restore.
                *self.roots.lock() =
                    (double_sha256(b"dirty-state"), double_sha256(b"dirty-utxo"));
                Err(VmError::Refused("scripted refusal".into()))
            }
        }
    }
}

/// Chain, pool and engine wired the way the assembler expects them.
pub struct TestHarness {
    pub chain: Arc<RwLock<Chain>>,
    pub mempool: Arc<Mempool>,
    pub engine: Arc<MockEngine>,
}

impl TestHarness {
    pub fn new(params: ConsensusParams) -> Self {
        Self::with_engine(params, MockEngine::new())
    }

    pub fn with_engine(params: ConsensusParams, engine: MockEngine) -> Self {
        let mut chain = Chain::new(params);
        chain.set_mock_time(TEST_TIME);
        TestHarness {
            chain: Arc::new(RwLock::new(chain)),
            mempool: Arc::new(Mempool::new()),
            engine: Arc::new(engine),
        }
    }

    /// Append `blocks` synthetic blocks to the chain view.
    pub fn advance_chain(&self, blocks: u32) {
        let mut chain = self.chain.write();
        for _ in 0..blocks {
            let time = chain.tip().time + 600;
            chain.append_tip(time);
        }
    }

    pub fn assembler(&self, options: AssemblerOptions) -> BlockAssembler {
        BlockAssembler::new(
            Arc::clone(&self.chain),
            Arc::clone(&self.mempool),
            Arc::clone(&self.engine) as Arc<dyn ContractEngine>,
            options,
        )
    }

    /// Assembly options with the fee floor disabled, the common case
    /// for selection scenarios.
    pub fn open_options() -> AssemblerOptions {
        AssemblerOptions {
            block_min_tx_fee: 0,
            ..Default::default()
        }
    }
}

/// A pay-to-tag script with one sigop, so entries carry realistic
/// sigop costs.
pub fn pay_to(tag: u8) -> Script {
    Script::new().push_slice(&[tag; 20]).push_opcode(OP_CHECKSIG)
}

/// An outpoint of an already-confirmed (non-pool) transaction.
pub fn confirmed(tag: u8) -> OutPoint {
    OutPoint::new(double_sha256(&[0xc0, tag]), 0)
}

/// A plain payment spending `prevouts`.
pub fn spend_tx(prevouts: &[OutPoint], tag: u8) -> Transaction {
    Transaction {
        version: 1,
        inputs: prevouts.iter().copied().map(TxIn::new).collect(),
        outputs: vec![TxOut {
            value: 100_000,
            script_pubkey: pay_to(tag),
        }],
        lock_time: 0,
    }
}

/// A contract call: one ordinary output plus an OP_CALL output.
pub fn contract_call_tx(prevout: OutPoint, tag: u8) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn::new(prevout)],
        outputs: vec![
            TxOut {
                value: 50_000,
                script_pubkey: pay_to(tag),
            },
            TxOut {
                value: 0,
                script_pubkey: Script::new()
                    .push_num(250_000) // gas limit
                    .push_num(40) // gas price
                    .push_slice(&[0x60, 0x60, tag]) // call data
                    .push_slice(&[tag; 20]) // contract address
                    .push_opcode(OP_CALL),
            },
        ],
        lock_time: 0,
    }
}

/// Fee paying exactly `sat_per_vb` over the transaction's virtual size.
pub fn rate_fee(tx: &Transaction, sat_per_vb: Amount) -> Amount {
    sat_per_vb * tx.virtual_size() as Amount
}

/// Transaction ids of a block, in order.
pub fn block_txids(block: &Block) -> Vec<Hash256> {
    block.transactions.iter().map(Transaction::txid).collect()
}

/// Index of `txid` within the block, if present.
pub fn block_position(block: &Block, txid: &Hash256) -> Option<usize> {
    block_txids(block).iter().position(|id| id == txid)
}

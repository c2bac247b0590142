//! Active chain view: tip, clocks, subsidy, fork activation, retarget
//! and the block validity test the assembler runs last.

use crate::params::{ConsensusParams, VERSIONBITS_TOP_BITS};
use crate::{ChainError, ChainResult};
use sbtc_primitives::{double_sha256, Amount, Block, BlockHeader, Hash256, COIN, MAX_BLOCK_WEIGHT};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Timestamp baked into the genesis index.
const GENESIS_TIME: u32 = 1_504_224_000;

/// Number of block times the past-median is computed over.
const MEDIAN_TIME_SPAN: usize = 11;

/// Index entry for one connected block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockIndex {
    pub height: u32,
    pub hash: Hash256,
    pub time: u32,
    pub bits: u32,
    pub version: i32,
}

/// In-memory header chain.
pub struct Chain {
    params: ConsensusParams,
    headers: Vec<BlockIndex>,
    mock_time: Option<i64>,
}

impl Chain {
    /// New chain holding only the genesis index.
    pub fn new(params: ConsensusParams) -> Self {
        let genesis = BlockIndex {
            height: 0,
            hash: double_sha256(b"genesis"),
            time: GENESIS_TIME,
            bits: params.pow_limit_bits,
            version: 1,
        };
        Chain {
            params,
            headers: vec![genesis],
            mock_time: None,
        }
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    /// Current best tip.
    pub fn tip(&self) -> BlockIndex {
        *self.headers.last().unwrap_or(&self.headers[0])
    }

    pub fn height(&self) -> u32 {
        self.tip().height
    }

    pub fn block_index(&self, height: u32) -> ChainResult<BlockIndex> {
        self.headers
            .get(height as usize)
            .copied()
            .ok_or(ChainError::UnknownHeight(height))
    }

    /// Append a synthetic index entry on top of the tip. Block import
    /// proper lives outside this crate; this advances the view the
    /// assembler reads.
    pub fn append_tip(&mut self, time: u32) -> BlockIndex {
        let prev = self.tip();
        let index = BlockIndex {
            height: prev.height + 1,
            hash: {
                let mut seed = prev.hash.0.to_vec();
                seed.extend_from_slice(&(prev.height + 1).to_le_bytes());
                seed.extend_from_slice(&time.to_le_bytes());
                double_sha256(&seed)
            },
            time,
            bits: self.next_work_required(&prev, time as i64),
            version: VERSIONBITS_TOP_BITS,
        };
        debug!(height = index.height, "chain tip advanced");
        self.headers.push(index);
        index
    }

    /// Median of the last eleven block times at `height`.
    pub fn median_time_past(&self, height: u32) -> i64 {
        let end = (height as usize + 1).min(self.headers.len());
        let start = end.saturating_sub(MEDIAN_TIME_SPAN);
        let mut times: Vec<i64> = self.headers[start..end]
            .iter()
            .map(|index| index.time as i64)
            .collect();
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// Network-adjusted wall clock.
    pub fn adjusted_time(&self) -> i64 {
        if let Some(mock) = self.mock_time {
            return mock;
        }
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    /// Pin the clock, for deterministic template assembly in tests.
    pub fn set_mock_time(&mut self, time: i64) {
        self.mock_time = Some(time);
    }

    /// Subsidy schedule: halves every interval, rounds to zero after
    /// 64 halvings.
    pub fn block_subsidy(&self, height: u32) -> Amount {
        let halvings = height / self.params.subsidy_halving_interval;
        if halvings >= 64 {
            return 0;
        }
        (50 * COIN) >> halvings
    }

    /// Whether the contract fork is active for a block whose parent is
    /// at `height`.
    pub fn is_contract_fork_enabled(&self, height: u32) -> bool {
        height >= self.params.contract_fork_height
    }

    /// Whether witness inclusion is enabled at the tip.
    pub fn is_witness_enabled(&self, _tip: &BlockIndex) -> bool {
        self.params.segwit_deployment_timeout != 0
    }

    /// Version for a block built on `_prev`.
    pub fn compute_block_version(&self, _prev: &BlockIndex) -> i32 {
        VERSIONBITS_TOP_BITS
    }

    /// Compact difficulty target for the next block.
    pub fn next_work_required(&self, prev: &BlockIndex, new_block_time: i64) -> u32 {
        let interval = self.params.difficulty_adjustment_interval();
        if (prev.height + 1) % interval != 0 {
            if self.params.allow_min_difficulty_blocks
                && new_block_time > prev.time as i64 + 2 * self.params.pow_target_spacing as i64
            {
                return self.params.pow_limit_bits;
            }
            return prev.bits;
        }

        let first_height = (prev.height + 1).saturating_sub(interval);
        let first = match self.headers.get(first_height as usize) {
            Some(index) => *index,
            None => return prev.bits,
        };
        let timespan = self.params.pow_target_timespan as i64;
        let mut actual = prev.time as i64 - first.time as i64;
        actual = actual.clamp(timespan / 4, timespan * 4);
        retarget_compact(prev.bits, actual as u64, timespan as u64, self.params.pow_limit_bits)
    }

    /// Structural validity of a candidate block on top of `prev`.
    /// PoW and merkle checks are optional so the assembler can verify
    /// a template before the miner fills those fields in.
    pub fn test_block_validity(
        &self,
        block: &Block,
        prev: &BlockIndex,
        check_pow: bool,
        check_merkle: bool,
    ) -> ChainResult<()> {
        let height = prev.height + 1;
        if block.transactions.is_empty() {
            return Err(ChainError::BlockValidity("block has no transactions".into()));
        }
        if !block.transactions[0].is_coinbase() {
            return Err(ChainError::BlockValidity(
                "first transaction is not a coinbase".into(),
            ));
        }
        let contract_active = self.is_contract_fork_enabled(prev.height);
        for (i, tx) in block.transactions.iter().enumerate().skip(1) {
            if tx.is_coinbase() {
                return Err(ChainError::BlockValidity(format!(
                    "duplicate coinbase at index {i}"
                )));
            }
            // The proof transaction is the only non-coinbase slot
            // allowed to carry null prevouts.
            let proof_slot = contract_active && i == 1;
            if !proof_slot && tx.inputs.iter().any(|input| input.prevout.is_null()) {
                return Err(ChainError::BlockValidity(format!(
                    "null prevout outside coinbase at index {i}"
                )));
            }
        }
        if block.weight() > MAX_BLOCK_WEIGHT {
            return Err(ChainError::BlockValidity(format!(
                "block weight {} above limit",
                block.weight()
            )));
        }
        let cutoff = self.median_time_past(prev.height);
        for (i, tx) in block.transactions.iter().enumerate() {
            if !tx.is_final(height, cutoff) {
                return Err(ChainError::BlockValidity(format!(
                    "non-final transaction at index {i}"
                )));
            }
        }
        if check_merkle && block.header.hash_merkle_root != block.merkle_root() {
            return Err(ChainError::BlockValidity("merkle root mismatch".into()));
        }
        if check_pow && !check_proof_of_work(&block.header) {
            return Err(ChainError::BlockValidity("proof of work below target".into()));
        }
        Ok(())
    }
}

/// Scale the previous compact target by `actual / timespan`, clamped
/// to the pow limit.
fn retarget_compact(bits: u32, actual: u64, timespan: u64, pow_limit_bits: u32) -> u32 {
    let (mut exponent, mantissa) = decode_compact(bits);
    let mut scaled = mantissa as u128 * actual as u128 / timespan as u128;
    while scaled > 0x007f_ffff {
        scaled >>= 8;
        exponent += 1;
    }
    while scaled != 0 && scaled < 0x8000 {
        scaled <<= 8;
        exponent -= 1;
    }
    let next = ((exponent as u32) << 24) | scaled as u32;
    let (limit_exp, limit_mant) = decode_compact(pow_limit_bits);
    if (exponent, scaled as u32) > (limit_exp, limit_mant) {
        return pow_limit_bits;
    }
    next
}

fn decode_compact(bits: u32) -> (i32, u32) {
    ((bits >> 24) as i32, bits & 0x007f_ffff)
}

/// Expand a compact target and compare the header hash against it as
/// 256-bit big-endian numbers.
fn check_proof_of_work(header: &BlockHeader) -> bool {
    let (exponent, mantissa) = decode_compact(header.bits);
    let mut target = [0u8; 32];
    let bytes = mantissa.to_be_bytes();
    // mantissa occupies positions [32 - exponent, 32 - exponent + 3)
    for (i, byte) in bytes[1..].iter().enumerate() {
        let pos = 32_i32 - exponent + i as i32;
        if (0..32).contains(&pos) {
            target[pos as usize] = *byte;
        } else if *byte != 0 {
            return false; // target overflows 256 bits downward
        }
    }
    let mut hash_be = header.block_hash().0;
    hash_be.reverse();
    hash_be <= target
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbtc_primitives::{OutPoint, Script, Transaction, TxIn, TxOut};

    fn coinbase(height: u32) -> Transaction {
        let mut input = TxIn::new(OutPoint::null());
        input.script_sig = Script::new().push_num(height as i64).push_opcode(0x00);
        Transaction {
            version: 1,
            inputs: vec![input],
            outputs: vec![TxOut {
                value: 50 * COIN,
                script_pubkey: Script::new().push_slice(&[0xaa; 20]),
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn test_subsidy_halving_schedule() {
        let chain = Chain::new(ConsensusParams::mainnet());
        assert_eq!(chain.block_subsidy(0), 50 * COIN);
        assert_eq!(chain.block_subsidy(209_999), 50 * COIN);
        assert_eq!(chain.block_subsidy(210_000), 25 * COIN);
        assert_eq!(chain.block_subsidy(420_000), 1_250_000_000);
        assert_eq!(chain.block_subsidy(64 * 210_000), 0);
    }

    #[test]
    fn test_median_time_past_is_median_of_eleven() {
        let mut chain = Chain::new(ConsensusParams::regtest());
        for i in 1..=20u32 {
            chain.append_tip(GENESIS_TIME + i * 600);
        }
        let tip = chain.tip();
        // Last 11 times are GENESIS + 10*600 ..= GENESIS + 20*600
        assert_eq!(
            chain.median_time_past(tip.height),
            (GENESIS_TIME + 15 * 600) as i64
        );
    }

    #[test]
    fn test_next_work_keeps_bits_off_boundary() {
        let mut chain = Chain::new(ConsensusParams::mainnet());
        let tip = chain.append_tip(GENESIS_TIME + 600);
        assert_eq!(
            chain.next_work_required(&tip, tip.time as i64 + 600),
            tip.bits
        );
    }

    #[test]
    fn test_min_difficulty_after_gap() {
        let mut chain = Chain::new(ConsensusParams::regtest());
        let tip = chain.append_tip(GENESIS_TIME + 600);
        let late = tip.time as i64 + 3 * 600;
        assert_eq!(chain.next_work_required(&tip, late), 0x207f_ffff);
    }

    #[test]
    fn test_validity_requires_coinbase_first() {
        let chain = Chain::new(ConsensusParams::mainnet());
        let prev = chain.tip();
        let block = Block {
            header: BlockHeader::default(),
            transactions: vec![],
        };
        assert!(chain.test_block_validity(&block, &prev, false, false).is_err());

        let block = Block {
            header: BlockHeader::default(),
            transactions: vec![coinbase(1)],
        };
        assert!(chain.test_block_validity(&block, &prev, false, false).is_ok());
    }

    #[test]
    fn test_validity_rejects_duplicate_coinbase() {
        let chain = Chain::new(ConsensusParams::mainnet());
        let prev = chain.tip();
        let block = Block {
            header: BlockHeader::default(),
            transactions: vec![coinbase(1), coinbase(1)],
        };
        let result = chain.test_block_validity(&block, &prev, false, false);
        assert!(matches!(result, Err(ChainError::BlockValidity(_))));
    }

    #[test]
    fn test_validity_allows_proof_slot_null_prevouts_past_fork() {
        let chain = Chain::new(ConsensusParams::regtest());
        let prev = chain.tip();
        let proof = Transaction {
            version: 1,
            inputs: vec![TxIn::new(OutPoint::null()), TxIn::new(OutPoint::null())],
            outputs: vec![TxOut {
                value: 0,
                script_pubkey: Script::new().push_opcode(0x6a),
            }],
            lock_time: 0,
        };
        let block = Block {
            header: BlockHeader::default(),
            transactions: vec![coinbase(1), proof],
        };
        assert!(chain.test_block_validity(&block, &prev, false, false).is_ok());
    }

    #[test]
    fn test_validity_checks_merkle_when_asked() {
        let chain = Chain::new(ConsensusParams::mainnet());
        let prev = chain.tip();
        let mut block = Block {
            header: BlockHeader::default(),
            transactions: vec![coinbase(1)],
        };
        assert!(chain
            .test_block_validity(&block, &prev, false, true)
            .is_err());
        block.header.hash_merkle_root = block.merkle_root();
        assert!(chain.test_block_validity(&block, &prev, false, true).is_ok());
    }
}

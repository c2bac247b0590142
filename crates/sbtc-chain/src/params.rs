//! Consensus parameters.

use sbtc_primitives::Hash256;
use serde::{Deserialize, Serialize};

/// Default VM state root committed before any contract has executed.
pub const DEFAULT_STATE_ROOT: Hash256 = Hash256([
    0x56, 0xe8, 0x1f, 0x17, 0x1b, 0xcc, 0x55, 0xa6,
    0xff, 0x83, 0x45, 0xe6, 0x92, 0xc0, 0xf8, 0x6e,
    0x5b, 0x48, 0xe0, 0x1b, 0x99, 0x6c, 0xad, 0xc0,
    0x01, 0x62, 0x2f, 0xb5, 0xe3, 0x63, 0xb4, 0x21,
]);

/// Default VM UTXO root committed before any contract has executed.
pub const DEFAULT_UTXO_ROOT: Hash256 = Hash256([
    0x21, 0xb4, 0x63, 0xe3, 0xb5, 0x2f, 0x62, 0x01,
    0xc0, 0xad, 0x6c, 0x99, 0x1b, 0xe0, 0x48, 0x5b,
    0x6e, 0xf8, 0xa0, 0x92, 0xe6, 0x45, 0x83, 0xff,
    0xa6, 0x55, 0xcc, 0x1b, 0x17, 0x1f, 0xe8, 0x56,
]);

/// Version field base for blocks produced by this node.
pub const VERSIONBITS_TOP_BITS: i32 = 0x2000_0000;

/// Chain-wide consensus parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusParams {
    /// Blocks between subsidy halvings.
    pub subsidy_halving_interval: u32,
    /// Easiest allowed compact difficulty target.
    pub pow_limit_bits: u32,
    /// Target seconds between blocks.
    pub pow_target_spacing: u32,
    /// Retarget window in seconds.
    pub pow_target_timespan: u32,
    /// Testnet rule: permit minimum-difficulty blocks after a gap.
    pub allow_min_difficulty_blocks: bool,
    /// Regtest rule: blocks are mined on demand, version overridable.
    pub mine_blocks_on_demand: bool,
    /// Segwit deployment timeout; zero means the deployment is unset
    /// and no witness commitment is produced.
    pub segwit_deployment_timeout: u64,
    /// Height at which the contract fork activates.
    pub contract_fork_height: u32,
}

impl ConsensusParams {
    /// Mainnet parameters.
    pub fn mainnet() -> Self {
        ConsensusParams {
            subsidy_halving_interval: 210_000,
            pow_limit_bits: 0x1d00_ffff,
            pow_target_spacing: 600,
            pow_target_timespan: 14 * 24 * 60 * 60,
            allow_min_difficulty_blocks: false,
            mine_blocks_on_demand: false,
            segwit_deployment_timeout: 1_510_704_000,
            contract_fork_height: 498_888,
        }
    }

    /// Regtest parameters: min-difficulty everywhere, contract fork
    /// active from the start.
    pub fn regtest() -> Self {
        ConsensusParams {
            subsidy_halving_interval: 150,
            pow_limit_bits: 0x207f_ffff,
            pow_target_spacing: 600,
            pow_target_timespan: 14 * 24 * 60 * 60,
            allow_min_difficulty_blocks: true,
            mine_blocks_on_demand: true,
            segwit_deployment_timeout: u64::MAX,
            contract_fork_height: 0,
        }
    }

    /// Blocks per retarget window.
    pub fn difficulty_adjustment_interval(&self) -> u32 {
        self.pow_target_timespan / self.pow_target_spacing
    }
}

//! Operator-facing assembly options.

use sbtc_primitives::Amount;
use serde::{Deserialize, Serialize};

/// Default weight budget for assembled templates.
pub const DEFAULT_BLOCK_MAX_WEIGHT: u64 = 3_996_000;

/// Default package floor feerate in sat/kvB.
pub const DEFAULT_BLOCK_MIN_TX_FEE: Amount = 1_000;

/// Assembly knobs, read once per template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblerOptions {
    /// Upper bound on template weight. Clamped into
    /// `[4000, MAX_BLOCK_WEIGHT - 4000]` at assembler construction so
    /// a template can always make progress.
    #[serde(default = "default_block_max_weight")]
    pub block_max_weight: u64,

    /// Floor feerate for package inclusion, in sat/kvB.
    #[serde(default = "default_block_min_tx_fee")]
    pub block_min_tx_fee: Amount,

    /// Header version override. Honored only on chains that mine
    /// blocks on demand.
    #[serde(default)]
    pub block_version: Option<i32>,

    /// Floor on accepted contract gas price, max'ed with the engine
    /// minimum.
    #[serde(default)]
    pub min_tx_gas_price: Option<u64>,

    /// Soft per-block gas ceiling, clamped to the hard limit.
    #[serde(default)]
    pub soft_block_gas_limit: Option<u64>,

    /// Per-transaction gas ceiling. Defaults to the soft block limit.
    #[serde(default)]
    pub max_tx_gas_limit: Option<u64>,

    /// Log each inclusion decision.
    #[serde(default)]
    pub print_priority: bool,
}

fn default_block_max_weight() -> u64 {
    DEFAULT_BLOCK_MAX_WEIGHT
}

fn default_block_min_tx_fee() -> Amount {
    DEFAULT_BLOCK_MIN_TX_FEE
}

impl Default for AssemblerOptions {
    fn default() -> Self {
        AssemblerOptions {
            block_max_weight: DEFAULT_BLOCK_MAX_WEIGHT,
            block_min_tx_fee: DEFAULT_BLOCK_MIN_TX_FEE,
            block_version: None,
            min_tx_gas_price: None,
            soft_block_gas_limit: None,
            max_tx_gas_limit: None,
            print_priority: false,
        }
    }
}

//! Block resource accounting: weight, sigop cost, transaction count
//! and accumulated fees.

use sbtc_primitives::{Amount, MAX_BLOCK_SIGOPS_COST, MAX_BLOCK_WEIGHT, WITNESS_SCALE_FACTOR};

/// Weight reserved up front for the eventual coinbase transaction.
pub const COINBASE_WEIGHT_RESERVATION: u64 = 4000;

/// Sigop cost reserved up front for the eventual coinbase transaction.
pub const COINBASE_SIGOPS_RESERVATION: i64 = 400;

/// Running totals for the block under assembly.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockResources {
    pub block_weight: u64,
    pub block_sigops_cost: i64,
    /// Selected transactions, coinbase excluded.
    pub block_tx: u64,
    pub fees: Amount,
}

impl BlockResources {
    /// Zero the counters, re-reserving the coinbase footprint.
    pub fn reset(&mut self) {
        self.block_weight = COINBASE_WEIGHT_RESERVATION;
        self.block_sigops_cost = COINBASE_SIGOPS_RESERVATION;
        self.block_tx = 0;
        self.fees = 0;
    }

    /// Whether a package still fits. Strict: a package that would land
    /// exactly on a limit is rejected.
    pub fn fits(&self, block_max_weight: u64, package_size: u64, package_sigops: i64) -> bool {
        if self.block_weight + WITNESS_SCALE_FACTOR * package_size >= block_max_weight {
            return false;
        }
        if self.block_sigops_cost + package_sigops >= MAX_BLOCK_SIGOPS_COST {
            return false;
        }
        true
    }

    /// Post-execution check of speculative totals against the
    /// consensus ceilings.
    pub fn final_fits(weight: u64, sigops: i64) -> bool {
        sigops * WITNESS_SCALE_FACTOR as i64 <= MAX_BLOCK_SIGOPS_COST && weight <= MAX_BLOCK_WEIGHT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> BlockResources {
        let mut resources = BlockResources::default();
        resources.reset();
        resources
    }

    #[test]
    fn test_reset_reserves_coinbase_budget() {
        let resources = fresh();
        assert_eq!(resources.block_weight, 4000);
        assert_eq!(resources.block_sigops_cost, 400);
        assert_eq!(resources.block_tx, 0);
        assert_eq!(resources.fees, 0);
    }

    #[test]
    fn test_fits_is_strict_on_weight() {
        let resources = fresh();
        let max = 8000u64;
        // 4000 + 4 * 1000 == 8000 hits the budget exactly: rejected
        assert!(!resources.fits(max, 1000, 0));
        assert!(resources.fits(max, 999, 0));
    }

    #[test]
    fn test_fits_is_strict_on_sigops() {
        let resources = fresh();
        let package_sigops = MAX_BLOCK_SIGOPS_COST - resources.block_sigops_cost;
        assert!(!resources.fits(u64::MAX, 1, package_sigops));
        assert!(resources.fits(MAX_BLOCK_WEIGHT, 1, package_sigops - 1));
    }

    #[test]
    fn test_final_fits_allows_exact_limits() {
        assert!(BlockResources::final_fits(
            MAX_BLOCK_WEIGHT,
            MAX_BLOCK_SIGOPS_COST / WITNESS_SCALE_FACTOR as i64
        ));
        assert!(!BlockResources::final_fits(MAX_BLOCK_WEIGHT + 1, 0));
        assert!(!BlockResources::final_fits(
            0,
            MAX_BLOCK_SIGOPS_COST / WITNESS_SCALE_FACTOR as i64 + 1
        ));
    }
}

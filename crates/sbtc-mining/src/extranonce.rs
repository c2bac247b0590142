//! Coinbase extra-nonce rewriting for the mining driver.
//!
//! Once the 32-bit header nonce is exhausted the driver bumps an
//! extra nonce carried in the coinbase scriptSig, which moves the
//! merkle root and reopens the header search space.

use parking_lot::Mutex;
use sbtc_chain::BlockIndex;
use sbtc_primitives::{Block, Hash256, Script};

/// Tag appended to the coinbase scriptSig after the extra nonce.
pub fn coinbase_flags() -> Script {
    Script::new().push_slice(b"/SBTC/")
}

/// Extra-nonce state: a counter that restarts whenever work moves to a
/// new previous block.
#[derive(Debug)]
pub struct ExtraNonceCounter {
    hash_prev_block: Hash256,
    extra_nonce: u32,
}

impl ExtraNonceCounter {
    pub const fn new() -> Self {
        ExtraNonceCounter {
            hash_prev_block: Hash256::ZERO,
            extra_nonce: 0,
        }
    }

    /// Bump the counter, rewrite the coinbase scriptSig as
    /// `height || extra_nonce || flags` and recompute the merkle root.
    /// Returns the applied extra nonce.
    pub fn increment(&mut self, block: &mut Block, prev: &BlockIndex) -> u32 {
        if self.hash_prev_block != block.header.hash_prev_block {
            self.extra_nonce = 0;
            self.hash_prev_block = block.header.hash_prev_block;
        }
        self.extra_nonce += 1;

        let height = prev.height + 1;
        let script_sig = Script::new()
            .push_num(height as i64)
            .push_scriptnum(self.extra_nonce as i64)
            .concat(&coinbase_flags());
        assert!(
            script_sig.len() <= 100,
            "coinbase scriptSig exceeds 100 bytes"
        );

        let mut coinbase = block.transactions[0].clone();
        coinbase.inputs[0].script_sig = script_sig;
        block.transactions[0] = coinbase;
        block.header.hash_merkle_root = block.merkle_root();
        self.extra_nonce
    }
}

impl Default for ExtraNonceCounter {
    fn default() -> Self {
        Self::new()
    }
}

static EXTRA_NONCE: Mutex<ExtraNonceCounter> = Mutex::new(ExtraNonceCounter::new());

/// Process-wide incrementer shared by every mining thread.
pub fn increment_extra_nonce(block: &mut Block, prev: &BlockIndex) -> u32 {
    EXTRA_NONCE.lock().increment(block, prev)
}

//! Transactions and their consensus-relevant arithmetic.

use crate::encode::{write_compact_size, write_i32_le, write_i64_le, write_u32_le, write_var_bytes};
use crate::hash::{double_sha256, Hash256};
use crate::script::{opcodes, Script};
use crate::{Amount, LOCKTIME_THRESHOLD, WITNESS_SCALE_FACTOR};

/// Sequence value that opts out of lock-time enforcement.
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

/// Reference to a transaction output.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct OutPoint {
    pub txid: Hash256,
    pub vout: u32,
}

impl OutPoint {
    /// The null outpoint used by coinbase-style inputs.
    pub const fn null() -> Self {
        OutPoint {
            txid: Hash256::ZERO,
            vout: u32::MAX,
        }
    }

    pub fn new(txid: Hash256, vout: u32) -> Self {
        OutPoint { txid, vout }
    }

    pub fn is_null(&self) -> bool {
        self.txid.is_null() && self.vout == u32::MAX
    }
}

/// Transaction input.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Script,
    pub sequence: u32,
    /// Witness stack, one byte vector per item.
    pub witness: Vec<Vec<u8>>,
}

impl TxIn {
    pub fn new(prevout: OutPoint) -> Self {
        TxIn {
            prevout,
            script_sig: Script::new(),
            sequence: SEQUENCE_FINAL,
            witness: Vec::new(),
        }
    }
}

/// Transaction output.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TxOut {
    pub value: Amount,
    pub script_pubkey: Script,
}

/// A transaction.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    /// Serialize; witness data is framed only when requested and present.
    pub fn serialize(&self, include_witness: bool) -> Vec<u8> {
        let witness = include_witness && self.has_witness();
        let mut buf = Vec::with_capacity(128);
        write_i32_le(&mut buf, self.version);
        if witness {
            buf.push(0x00); // marker
            buf.push(0x01); // flag
        }
        write_compact_size(&mut buf, self.inputs.len() as u64);
        for input in &self.inputs {
            buf.extend_from_slice(input.prevout.txid.as_bytes());
            write_u32_le(&mut buf, input.prevout.vout);
            write_var_bytes(&mut buf, input.script_sig.as_bytes());
            write_u32_le(&mut buf, input.sequence);
        }
        write_compact_size(&mut buf, self.outputs.len() as u64);
        for output in &self.outputs {
            write_i64_le(&mut buf, output.value);
            write_var_bytes(&mut buf, output.script_pubkey.as_bytes());
        }
        if witness {
            for input in &self.inputs {
                write_compact_size(&mut buf, input.witness.len() as u64);
                for item in &input.witness {
                    write_var_bytes(&mut buf, item);
                }
            }
        }
        write_u32_le(&mut buf, self.lock_time);
        buf
    }

    /// Transaction id: hash of the serialization without witness data.
    pub fn txid(&self) -> Hash256 {
        double_sha256(&self.serialize(false))
    }

    /// Witness transaction id. Equal to `txid` for witness-free
    /// transactions.
    pub fn wtxid(&self) -> Hash256 {
        if self.has_witness() {
            double_sha256(&self.serialize(true))
        } else {
            self.txid()
        }
    }

    /// Serialized size without witness data.
    pub fn base_size(&self) -> usize {
        self.serialize(false).len()
    }

    /// Serialized size with witness data.
    pub fn total_size(&self) -> usize {
        self.serialize(true).len()
    }

    /// Witness-scaled size: `3 * base + total`.
    pub fn weight(&self) -> u64 {
        3 * self.base_size() as u64 + self.total_size() as u64
    }

    /// Virtual size in bytes, rounding the weight up.
    pub fn virtual_size(&self) -> u64 {
        (self.weight() + WITNESS_SCALE_FACTOR - 1) / WITNESS_SCALE_FACTOR
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|input| !input.witness.is_empty())
    }

    /// Whether any output deploys or invokes a contract.
    pub fn has_create_or_call(&self) -> bool {
        self.outputs.iter().any(|out| {
            out.script_pubkey.contains_op(opcodes::OP_CREATE)
                || out.script_pubkey.contains_op(opcodes::OP_CALL)
        })
    }

    /// Lock-time finality at the given height and time cutoff.
    pub fn is_final(&self, height: u32, block_time: i64) -> bool {
        if self.lock_time == 0 {
            return true;
        }
        let cutoff = if self.lock_time < LOCKTIME_THRESHOLD {
            height as i64
        } else {
            block_time
        };
        if (self.lock_time as i64) < cutoff {
            return true;
        }
        self.inputs
            .iter()
            .all(|input| input.sequence == SEQUENCE_FINAL)
    }

    /// Legacy signature-operation count over all input and output
    /// scripts.
    pub fn legacy_sigop_count(&self) -> i64 {
        let inputs: i64 = self
            .inputs
            .iter()
            .map(|input| input.script_sig.legacy_sigop_count())
            .sum();
        let outputs: i64 = self
            .outputs
            .iter()
            .map(|output| output.script_pubkey.legacy_sigop_count())
            .sum();
        inputs + outputs
    }
}

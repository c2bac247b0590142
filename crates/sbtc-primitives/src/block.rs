//! Block headers, blocks and merkle roots.

use crate::encode::{write_i32_le, write_u32_le};
use crate::hash::{double_sha256, hash_pair, Hash256};
use crate::transaction::Transaction;

/// Block header.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct BlockHeader {
    pub version: i32,
    pub hash_prev_block: Hash256,
    pub hash_merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// 80-byte serialization.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(80);
        write_i32_le(&mut buf, self.version);
        buf.extend_from_slice(self.hash_prev_block.as_bytes());
        buf.extend_from_slice(self.hash_merkle_root.as_bytes());
        write_u32_le(&mut buf, self.time);
        write_u32_le(&mut buf, self.bits);
        write_u32_le(&mut buf, self.nonce);
        buf
    }

    /// Proof-of-work hash of the header.
    pub fn block_hash(&self) -> Hash256 {
        double_sha256(&self.serialize())
    }
}

/// A block: header plus ordered transactions.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Total block weight.
    pub fn weight(&self) -> u64 {
        self.transactions.iter().map(Transaction::weight).sum()
    }

    /// Merkle root over transaction ids.
    pub fn merkle_root(&self) -> Hash256 {
        merkle_root_from_leaves(self.transactions.iter().map(Transaction::txid).collect())
    }

    /// Merkle root over witness transaction ids. The coinbase leaf is
    /// pinned to the null hash.
    pub fn witness_merkle_root(&self) -> Hash256 {
        let mut leaves: Vec<Hash256> = Vec::with_capacity(self.transactions.len());
        for (i, tx) in self.transactions.iter().enumerate() {
            leaves.push(if i == 0 { Hash256::ZERO } else { tx.wtxid() });
        }
        merkle_root_from_leaves(leaves)
    }
}

/// Pairwise double-SHA256 reduction, duplicating an odd tail node.
fn merkle_root_from_leaves(mut level: Vec<Hash256>) -> Hash256 {
    if level.is_empty() {
        return Hash256::ZERO;
    }
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let right = if pair.len() == 2 { &pair[1] } else { &pair[0] };
            next.push(hash_pair(&pair[0], right));
        }
        level = next;
    }
    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{OutPoint, TxIn, TxOut};
    use crate::Script;

    fn tx(tag: u8) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn::new(OutPoint::new(double_sha256(&[tag]), 0))],
            outputs: vec![TxOut {
                value: 1,
                script_pubkey: Script::new().push_slice(&[tag]),
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn test_single_tx_merkle_root_is_txid() {
        let block = Block {
            header: BlockHeader::default(),
            transactions: vec![tx(1)],
        };
        assert_eq!(block.merkle_root(), block.transactions[0].txid());
    }

    #[test]
    fn test_merkle_root_changes_with_order() {
        let a = Block {
            header: BlockHeader::default(),
            transactions: vec![tx(1), tx(2)],
        };
        let b = Block {
            header: BlockHeader::default(),
            transactions: vec![tx(2), tx(1)],
        };
        assert_ne!(a.merkle_root(), b.merkle_root());
    }

    #[test]
    fn test_odd_leaf_count_duplicates_tail() {
        let two = merkle_root_from_leaves(vec![double_sha256(b"a"), double_sha256(b"a")]);
        let padded = merkle_root_from_leaves(vec![
            double_sha256(b"x"),
            double_sha256(b"a"),
            double_sha256(b"a"),
        ]);
        // Three leaves hash the last pair as (a, a); the two-leaf tree
        // over (a, a) must appear as the right branch.
        let left = hash_pair(&double_sha256(b"x"), &double_sha256(b"a"));
        assert_eq!(padded, hash_pair(&left, &two));
    }

    #[test]
    fn test_witness_root_pins_coinbase_leaf() {
        let mut coinbase = tx(0);
        coinbase.inputs = vec![TxIn::new(OutPoint::null())];
        let mut with_witness = coinbase.clone();
        with_witness.inputs[0].witness = vec![vec![0u8; 32]];

        let a = Block {
            header: BlockHeader::default(),
            transactions: vec![coinbase, tx(1)],
        };
        let b = Block {
            header: BlockHeader::default(),
            transactions: vec![with_witness, tx(1)],
        };
        // Coinbase witness must not move the witness merkle root
        assert_eq!(a.witness_merkle_root(), b.witness_merkle_root());
    }

    #[test]
    fn test_header_hash_covers_nonce() {
        let mut header = BlockHeader::default();
        let before = header.block_hash();
        header.nonce = 1;
        assert_ne!(before, header.block_hash());
        assert_eq!(header.serialize().len(), 80);
    }
}

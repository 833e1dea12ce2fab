//! Test data generators.
use std::sync::Arc;

use ohmc_types::{Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut};

/// Returns a coinbase transaction, unique per `height` and `salt`.
pub fn coinbase(height: u64, salt: u32) -> Transaction {
    let mut signature_script = height.to_le_bytes().to_vec();
    signature_script.extend_from_slice(&salt.to_le_bytes());

    Transaction {
        version: 1,
        inputs: vec![TxIn {
            previous_output: OutPoint {
                hash: [0; 32],
                index: u32::MAX,
            },
            signature_script,
            sequence: u32::MAX,
        }],
        outputs: vec![TxOut {
            value: 50,
            pk_script: vec![0x51],
        }],
        lock_time: 0,
    }
}

/// Returns a transaction spending output `index` of the transaction with `hash`.
pub fn spend(hash: [u8; 32], index: u32) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn {
            previous_output: OutPoint { hash, index },
            signature_script: vec![],
            sequence: u32::MAX,
        }],
        outputs: vec![TxOut {
            value: 10,
            pk_script: vec![0x51],
        }],
        lock_time: 0,
    }
}

/// Returns a block with the given parent and transactions.
pub fn block(previous: [u8; 32], height: u64, salt: u32, extra_txs: Vec<Transaction>) -> Block {
    let mut transactions = vec![coinbase(height, salt)];
    transactions.extend(extra_txs);

    Block {
        header: BlockHeader {
            version: 1,
            previous,
            merkle_root: transactions[0].hash(),
            timestamp: 1_600_000_000 + u32::try_from(height).unwrap() * 600,
            bits: 0x207f_ffff,
            nonce: salt,
        },
        transactions,
    }
}

/// Returns the test genesis block.
pub fn genesis() -> Block {
    block([0; 32], 0, 0, vec![])
}

/// Returns `len` blocks building on `parent`, which is at `parent_height`.
///
/// Different `salt`s give different chains.
pub fn build_chain_from(parent: &Block, parent_height: u64, len: usize, salt: u32) -> Vec<Block> {
    let mut previous = parent.hash();
    let mut blocks = Vec::with_capacity(len);

    for i in 1..=len as u64 {
        let b = block(previous, parent_height + i, salt, vec![]);
        previous = b.hash();
        blocks.push(b);
    }

    blocks
}

/// Returns `len` blocks building on [`genesis`], the block at index `i` is at height `i + 1`.
pub fn build_chain(len: usize) -> Vec<Block> {
    build_chain_from(&genesis(), 0, len, 0)
}

/// Wraps every block in an [`Arc`].
pub fn arced(blocks: Vec<Block>) -> Vec<Arc<Block>> {
    blocks.into_iter().map(Arc::new).collect()
}

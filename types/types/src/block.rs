//! Blocks & block headers.
use borsh::{BorshDeserialize, BorshSerialize};

use crate::Transaction;

/// The length, in bytes, of a serialized [`BlockHeader`].
pub const BLOCK_HEADER_LEN: usize = 80;

/// A block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct BlockHeader {
    /// The block version.
    pub version: i32,
    /// The hash of the previous block.
    pub previous: [u8; 32],
    /// The merkle root of the block's transactions.
    pub merkle_root: [u8; 32],
    /// The block timestamp, in seconds since the unix epoch.
    pub timestamp: u32,
    /// The compact difficulty target.
    pub bits: u32,
    /// The proof-of-work nonce.
    pub nonce: u32,
}

impl BlockHeader {
    /// Serializes the header into its fixed [`BLOCK_HEADER_LEN`] byte form.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BLOCK_HEADER_LEN);
        BorshSerialize::serialize(self, &mut buf).expect("writing to a Vec never fails");
        buf
    }

    /// Returns the hash of this header, which is also the block's ID.
    pub fn hash(&self) -> [u8; 32] {
        *blake3::hash(&self.serialize()).as_bytes()
    }
}

/// A full block.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Block {
    /// The block's header.
    pub header: BlockHeader,
    /// The block's transactions, the first one is the coinbase.
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Returns the block's ID, the hash of its header.
    pub fn hash(&self) -> [u8; 32] {
        self.header.hash()
    }

    /// Returns the hash of the parent block.
    pub const fn previous(&self) -> [u8; 32] {
        self.header.previous
    }

    /// Returns the hashes of every transaction in this block.
    pub fn tx_hashes(&self) -> Vec<[u8; 32]> {
        self.transactions.iter().map(Transaction::hash).collect()
    }
}

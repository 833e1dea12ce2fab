//! Transactions.
use borsh::{BorshDeserialize, BorshSerialize};

/// A reference to a previous transaction output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct OutPoint {
    /// The hash of the transaction holding the output.
    pub hash: [u8; 32],
    /// The index of the output.
    pub index: u32,
}

/// A transaction input.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct TxIn {
    pub previous_output: OutPoint,
    pub signature_script: Vec<u8>,
    pub sequence: u32,
}

/// A transaction output.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct TxOut {
    pub value: i64,
    pub pk_script: Vec<u8>,
}

/// A transaction.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    /// Serializes the transaction.
    pub fn serialize(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("writing to a Vec never fails")
    }

    /// Returns the transaction's hash.
    pub fn hash(&self) -> [u8; 32] {
        *blake3::hash(&self.serialize()).as_bytes()
    }

    /// Returns `true` if this is a coinbase transaction, a transaction with a single input
    /// spending the null outpoint.
    pub fn is_coinbase(&self) -> bool {
        matches!(
            self.inputs.as_slice(),
            [input] if input.previous_output.hash == [0; 32] && input.previous_output.index == u32::MAX
        )
    }
}

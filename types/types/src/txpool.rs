//! Transaction pool [`TxPoolRequest`]s, [`TxPoolResponse`]s and [`TxPoolError`]s.
//---------------------------------------------------------------------------------------------------- Import
use std::sync::Arc;

use crate::{Block, Transaction};

//---------------------------------------------------------------------------------------------------- TxDesc
/// A transaction accepted into the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxDesc {
    /// The transaction.
    pub tx: Arc<Transaction>,
    /// The transaction's hash.
    pub hash: [u8; 32],
    /// The chain height when the transaction was added.
    pub height: u64,
    /// The fee the transaction pays.
    pub fee: u64,
}

impl TxDesc {
    /// Creates a new [`TxDesc`], calculating the transaction's hash.
    pub fn new(tx: Arc<Transaction>, height: u64, fee: u64) -> Self {
        Self {
            hash: tx.hash(),
            tx,
            height,
            fee,
        }
    }
}

//---------------------------------------------------------------------------------------------------- Request
/// A request to the transaction pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxPoolRequest {
    /// Validate a transaction and add it to the pool.
    ///
    /// Answered with [`TxPoolResponse::Accepted`], containing the transaction and any orphan
    /// transactions it allowed into the pool.
    ProcessTransaction(Arc<Transaction>),

    /// Check if a transaction is in the pool, including as an orphan.
    HaveTransaction([u8; 32]),

    /// A block was connected to the main chain, remove its transactions and any double spends.
    ///
    /// Answered with [`TxPoolResponse::Accepted`], containing orphan transactions the block
    /// allowed into the pool.
    BlockConnected(Arc<Block>),
}

//---------------------------------------------------------------------------------------------------- Response
/// A response from the transaction pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxPoolResponse {
    /// Transactions that were added to the pool.
    Accepted(Vec<TxDesc>),
    /// Response to [`TxPoolRequest::HaveTransaction`].
    HaveTransaction(bool),
}

//---------------------------------------------------------------------------------------------------- Error
/// An error returned by the transaction pool.
#[derive(Debug, thiserror::Error)]
pub enum TxPoolError {
    /// The transaction is already in the pool.
    #[error("duplicate transaction")]
    Duplicate,
    /// The transaction is valid but the pool's policy does not allow it.
    #[error("transaction rejected by policy: {0}")]
    Policy(String),
    /// The transaction broke a consensus rule.
    #[error("consensus rule broken: {0}")]
    Rule(String),
    /// Something went wrong inside the pool.
    #[error("internal pool error: {0}")]
    Internal(#[from] crate::BoxError),
}

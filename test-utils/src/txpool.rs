//! An in-memory transaction pool service.
use std::{
    collections::{HashMap, HashSet},
    future::{ready, Ready},
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll},
};

use tower::Service;

use ohmc_types::{
    txpool::{TxDesc, TxPoolError, TxPoolRequest, TxPoolResponse},
    Transaction,
};

#[derive(Debug, Default)]
struct MockTxPoolState {
    pool: HashMap<[u8; 32], Arc<Transaction>>,
    policy_rejects: HashSet<[u8; 32]>,
    rule_rejects: HashSet<[u8; 32]>,
    processed: Vec<[u8; 32]>,
    connected_blocks: Vec<[u8; 32]>,
    orphans_on_connect: Vec<TxDesc>,
}

/// An in-memory transaction pool service.
///
/// Cloning gives another handle to the same pool.
#[derive(Debug, Clone, Default)]
pub struct MockTxPool(Arc<Mutex<MockTxPoolState>>);

impl MockTxPool {
    /// Creates a new, empty, pool.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockTxPoolState> {
        self.0.lock().unwrap()
    }

    /// Makes the pool reject the transaction with this hash for policy reasons.
    pub fn reject_for_policy(&self, hash: [u8; 32]) {
        self.state().policy_rejects.insert(hash);
    }

    /// Makes the pool reject the transaction with this hash as breaking a consensus rule.
    pub fn reject_for_rule(&self, hash: [u8; 32]) {
        self.state().rule_rejects.insert(hash);
    }

    /// Sets transactions to return as newly accepted orphans on the next [`TxPoolRequest::BlockConnected`].
    pub fn accept_orphans_on_next_block(&self, txs: Vec<TxDesc>) {
        self.state().orphans_on_connect = txs;
    }

    /// Returns `true` if the transaction is in the pool.
    pub fn contains(&self, hash: &[u8; 32]) -> bool {
        self.state().pool.contains_key(hash)
    }

    /// Returns the hashes of every transaction given in a [`TxPoolRequest::ProcessTransaction`], in order.
    pub fn processed_txs(&self) -> Vec<[u8; 32]> {
        self.state().processed.clone()
    }

    /// Returns the hashes of every block given in a [`TxPoolRequest::BlockConnected`], in order.
    pub fn connected_blocks(&self) -> Vec<[u8; 32]> {
        self.state().connected_blocks.clone()
    }

    fn handle(&self, req: TxPoolRequest) -> Result<TxPoolResponse, TxPoolError> {
        let mut state = self.state();

        Ok(match req {
            TxPoolRequest::ProcessTransaction(tx) => {
                let hash = tx.hash();
                state.processed.push(hash);

                if state.pool.contains_key(&hash) {
                    return Err(TxPoolError::Duplicate);
                }
                if state.rule_rejects.contains(&hash) {
                    return Err(TxPoolError::Rule("invalid transaction".to_string()));
                }
                if state.policy_rejects.contains(&hash) {
                    return Err(TxPoolError::Policy("fee too low".to_string()));
                }

                state.pool.insert(hash, Arc::clone(&tx));

                TxPoolResponse::Accepted(vec![TxDesc::new(tx, 0, 0)])
            }
            TxPoolRequest::HaveTransaction(hash) => {
                TxPoolResponse::HaveTransaction(state.pool.contains_key(&hash))
            }
            TxPoolRequest::BlockConnected(block) => {
                state.connected_blocks.push(block.hash());
                for tx in &block.transactions {
                    state.pool.remove(&tx.hash());
                }

                TxPoolResponse::Accepted(std::mem::take(&mut state.orphans_on_connect))
            }
        })
    }
}

impl Service<TxPoolRequest> for MockTxPool {
    type Response = TxPoolResponse;
    type Error = TxPoolError;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: TxPoolRequest) -> Self::Future {
        ready(self.handle(req))
    }
}

//! The services and traits the sync manager uses to talk to the rest of the node.
//!
//! The chain and transaction pool are [`tower::Service`]s taking the requests defined in
//! [`ohmc_types::chain`] and [`ohmc_types::txpool`], notifications to peers go through a
//! [`PeerNotifier`](ohmc_p2p_core::PeerNotifier).
use ohmc_types::{Block, BoxError};

pub use ohmc_types::{
    chain::{BehaviorFlags, BestState, ChainError, ChainRequest, ChainResponse},
    txpool::{TxDesc, TxPoolError, TxPoolRequest, TxPoolResponse},
};

/// A fee estimator, told about every block connected to the main chain.
pub trait FeeEstimator: Send + 'static {
    /// Registers a newly connected block.
    ///
    /// # Errors
    ///
    /// An error means the estimator is in an invalid state, it will not be used again.
    fn register_block(&mut self, block: &Block) -> Result<(), BoxError>;
}

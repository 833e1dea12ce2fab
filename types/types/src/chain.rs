//! Chain [`ChainRequest`]s, [`ChainResponse`]s and [`ChainError`]s.
//!
//! These are the requests the sync manager makes to the chain service, the component that fully
//! validates blocks and owns the main chain.
//---------------------------------------------------------------------------------------------------- Import
use std::sync::Arc;

use crate::{Block, BlockHeader};

//---------------------------------------------------------------------------------------------------- BehaviorFlags
bitflags::bitflags! {
    /// Flags changing how the chain service processes a block.
    #[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct BehaviorFlags: u32 {
        /// No special behaviour.
        const NONE = 0;
        /// The block's header has already been verified to link to a checkpoint, so expensive checks
        /// can be skipped.
        const FAST_ADD = 1 << 0;
        /// Do not check proof of work.
        const NO_POW_CHECK = 1 << 1;
    }
}

//---------------------------------------------------------------------------------------------------- BestState
/// A snapshot of the chain's tip.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct BestState {
    /// The hash of the top block.
    pub hash: [u8; 32],
    /// The height of the top block.
    pub height: u64,
}

//---------------------------------------------------------------------------------------------------- Request
/// A request to the chain service.
///
/// This pairs with [`ChainResponse`], where each variant here matches in name with a
/// [`ChainResponse`] variant, except [`ChainRequest::ProcessHeaders`] which is answered with
/// [`ChainResponse::HeadersAccepted`] and [`ChainRequest::ProcessBlock`] which is answered
/// with [`ChainResponse::BlockProcessed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainRequest {
    /// Check a batch of linked headers, each must connect to the one before it and the first to a
    /// header the chain already knows.
    ProcessHeaders(Vec<BlockHeader>),

    /// Validate a block and, if it is valid, add it to the chain.
    ProcessBlock {
        block: Arc<Block>,
        flags: BehaviorFlags,
    },

    /// Get the current [`BestState`].
    BestSnapshot,

    /// Check if the block with this hash is known to the chain, on any branch.
    HaveBlock([u8; 32]),

    /// Get the height of the block with this hash, if it is known.
    BlockHeight([u8; 32]),

    /// Get a block locator for the current tip.
    LatestBlockLocator,

    /// Get a block locator starting at the block with this hash.
    BlockLocatorFromHash([u8; 32]),

    /// Check if the chain believes it is synced with the network.
    IsCurrent,
}

//---------------------------------------------------------------------------------------------------- Response
/// A response from the chain service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainResponse {
    /// Response to [`ChainRequest::ProcessHeaders`], the number of headers accepted.
    HeadersAccepted(usize),

    /// Response to [`ChainRequest::ProcessBlock`].
    BlockProcessed {
        /// `true` if the chain does not know the block's parent.
        is_orphan: bool,
    },

    /// Response to [`ChainRequest::BestSnapshot`].
    BestSnapshot(BestState),

    /// Response to [`ChainRequest::HaveBlock`].
    HaveBlock(bool),

    /// Response to [`ChainRequest::BlockHeight`].
    BlockHeight(Option<u64>),

    /// Response to [`ChainRequest::LatestBlockLocator`] and [`ChainRequest::BlockLocatorFromHash`].
    ///
    /// The hashes go from the newest block backwards.
    BlockLocator(Vec<[u8; 32]>),

    /// Response to [`ChainRequest::IsCurrent`].
    IsCurrent(bool),
}

//---------------------------------------------------------------------------------------------------- Error
/// An error returned by the chain service.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// The block is already known.
    #[error("duplicate block")]
    Duplicate,
    /// The block or header broke a consensus rule.
    #[error("consensus rule broken: {0}")]
    Rule(String),
    /// Something went wrong inside the chain service, not caused by the data given to it.
    #[error("internal chain error: {0}")]
    Internal(#[from] crate::BoxError),
}

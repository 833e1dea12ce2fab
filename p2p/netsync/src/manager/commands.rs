use std::sync::Arc;

use tokio::sync::oneshot;

use ohmc_p2p_core::{PeerClient, PeerId};
use ohmc_types::{
    chain::{BehaviorFlags, ChainError},
    Block, BlockHeader, InvVect, Transaction,
};

/// An event for the sync manager, queued through a [`SyncManagerHandle`](crate::SyncManagerHandle).
pub(crate) enum SyncEvent {
    /// A new peer finished its handshake.
    PeerConnected(PeerClient),
    /// A peer disconnected.
    PeerDisconnected(PeerId),
    /// A peer sent a `headers` message.
    HeadersReceived {
        peer: PeerId,
        headers: Vec<BlockHeader>,
    },
    /// A peer sent a block.
    BlockReceived {
        peer: PeerId,
        block: Arc<Block>,
        /// Completed once the block has been handled.
        done_tx: oneshot::Sender<()>,
    },
    /// A peer sent an `inv` message.
    InvReceived { peer: PeerId, inv: Vec<InvVect> },
    /// A peer sent a transaction.
    TxReceived {
        peer: PeerId,
        tx: Arc<Transaction>,
        /// Completed once the transaction has been handled.
        done_tx: oneshot::Sender<()>,
    },
    /// A peer sent a `notfound` message.
    NotFoundReceived { peer: PeerId, inv: Vec<InvVect> },
    /// Something asked us to look for work to request.
    RescanRequested,
    /// A command with a response.
    Command(SyncCommand),
}

/// A command for the sync manager that expects a response.
pub(crate) enum SyncCommand {
    /// Get the current sync peer.
    SyncPeerId(oneshot::Sender<Option<PeerId>>),
    /// Process a block that did not come from a peer.
    ProcessBlock {
        block: Arc<Block>,
        flags: BehaviorFlags,
        /// Returns if the block is an orphan.
        response_tx: oneshot::Sender<Result<bool, ChainError>>,
    },
    /// Check if we believe we are synced with our peers.
    IsCurrent(oneshot::Sender<bool>),
    /// Stop handling events until `resume_rx` completes.
    Pause {
        paused_tx: oneshot::Sender<()>,
        resume_rx: oneshot::Receiver<()>,
    },
}

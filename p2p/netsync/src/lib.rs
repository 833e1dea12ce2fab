//! # Ohmc netsync
//!
//! The block and transaction sync manager.
//!
//! The sync manager drives the download of the chain from our peers. Below the last checkpoint it
//! downloads the headers up to the next checkpoint from a single sync peer, then the blocks for those
//! headers from every peer that has them. Past the last checkpoint blocks are downloaded from the
//! sync peer as it announces them. Blocks that arrive before their parent are held in an orphan pool.
//!
//! Peer connection tasks report what their peer sends through a [`SyncManagerHandle`], the sync
//! manager answers through each peer's [`PeerClient`](ohmc_p2p_core::PeerClient) and tells the rest
//! of the node about new data through a [`PeerNotifier`].
//!
//! # Usage
//!
//! ```rust,ignore
//! let (notifier, notifications) = BroadcastNotifier::new(128);
//!
//! let (handle, _task) = SyncManagerBuilder::new(config, chain_svc, txpool_svc, notifier)
//!     .with_tracing_dispatch(tracing::Dispatch::default())
//!     .spawn();
//!
//! handle.new_peer(peer_client).await?;
//! ```
use std::sync::Arc;

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::{instrument::WithSubscriber, Dispatch, Instrument, Span};

use ohmc_p2p_core::{PeerClient, PeerId, PeerNotifier};
use ohmc_types::{
    chain::{BehaviorFlags, ChainError, ChainRequest, ChainResponse},
    txpool::{TxPoolError, TxPoolRequest, TxPoolResponse},
    Block, BlockHeader, InvVect, Transaction,
};

mod checkpoint;
mod config;
pub mod constants;
mod error;
pub mod interface;
mod manager;
mod orphan_pool;
mod peer_state;
mod progress;
mod scheduler;
mod stall;

pub use config::{ConfigError, SyncManagerConfig};
pub use error::{Misbehaviour, SyncError, SyncManagerError};
pub use interface::FeeEstimator;

use manager::{
    commands::{SyncCommand, SyncEvent},
    SyncManager,
};

/// A builder for the sync manager task.
pub struct SyncManagerBuilder<C, T> {
    config: SyncManagerConfig,
    chain: C,
    txpool: T,
    notifier: Box<dyn PeerNotifier>,
    fee_estimator: Option<Box<dyn FeeEstimator>>,
    dispatch: Dispatch,
    parent_span: Option<Span>,
    shutdown: CancellationToken,
}

impl<C, T> SyncManagerBuilder<C, T>
where
    C: Service<ChainRequest, Response = ChainResponse, Error = ChainError> + Send + 'static,
    C::Future: Send,
    T: Service<TxPoolRequest, Response = TxPoolResponse, Error = TxPoolError> + Send + 'static,
    T::Future: Send,
{
    /// Creates a new builder with the required collaborators.
    pub fn new(
        config: SyncManagerConfig,
        chain: C,
        txpool: T,
        notifier: impl PeerNotifier,
    ) -> Self {
        Self {
            config,
            chain,
            txpool,
            notifier: Box::new(notifier),
            fee_estimator: None,
            dispatch: Dispatch::none(),
            parent_span: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Adds a fee estimator, told about every block connected to the main chain.
    #[must_use]
    pub fn with_fee_estimator(self, fee_estimator: impl FeeEstimator) -> Self {
        Self {
            fee_estimator: Some(Box::new(fee_estimator)),
            ..self
        }
    }

    /// Sets where the sync manager's logs go.
    ///
    /// ## Default
    ///
    /// The default is [`Dispatch::none`], which drops every log.
    #[must_use]
    pub fn with_tracing_dispatch(self, dispatch: Dispatch) -> Self {
        Self { dispatch, ..self }
    }

    /// Sets the parent [`Span`] of the sync manager's span.
    #[must_use]
    pub fn with_parent_span(self, parent_span: Span) -> Self {
        Self {
            parent_span: Some(parent_span),
            ..self
        }
    }

    /// Sets a token that stops the sync manager when cancelled.
    #[must_use]
    pub fn with_shutdown_token(self, shutdown: CancellationToken) -> Self {
        Self { shutdown, ..self }
    }

    /// Spawns the sync manager task.
    ///
    /// The task stops when the shutdown token is cancelled or every [`SyncManagerHandle`] is dropped.
    ///
    /// # Panics
    ///
    /// This must be called from inside a tokio runtime.
    pub fn spawn(self) -> (SyncManagerHandle, JoinHandle<()>) {
        let (event_tx, event_rx) = mpsc::channel(self.config.event_channel_size());

        let span = tracing::dispatcher::with_default(&self.dispatch, || match &self.parent_span {
            Some(parent) => tracing::info_span!(parent: parent, "sync_manager"),
            None => tracing::info_span!("sync_manager"),
        });

        let manager = SyncManager::new(
            self.config,
            self.chain,
            self.txpool,
            self.notifier,
            self.fee_estimator,
            self.shutdown,
        );

        let task = tokio::spawn(
            manager
                .run(event_rx)
                .instrument(span)
                .with_subscriber(self.dispatch),
        );

        (SyncManagerHandle { event_tx }, task)
    }
}

/// Spawns a sync manager with no fee estimator, logging to nowhere.
///
/// See [`SyncManagerBuilder`] for more options.
pub fn init_sync_manager<C, T>(
    config: SyncManagerConfig,
    chain: C,
    txpool: T,
    notifier: impl PeerNotifier,
) -> SyncManagerHandle
where
    C: Service<ChainRequest, Response = ChainResponse, Error = ChainError> + Send + 'static,
    C::Future: Send,
    T: Service<TxPoolRequest, Response = TxPoolResponse, Error = TxPoolError> + Send + 'static,
    T::Future: Send,
{
    SyncManagerBuilder::new(config, chain, txpool, notifier)
        .spawn()
        .0
}

/// A handle to the sync manager.
///
/// Events are handled in the order they are queued, across all handles. Queuing waits if the sync
/// manager is behind.
#[derive(Debug, Clone)]
pub struct SyncManagerHandle {
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncManagerHandle {
    async fn send(&self, event: SyncEvent) -> Result<(), SyncManagerError> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| SyncManagerError::ManagerStopped)
    }

    async fn command<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<R>) -> SyncCommand,
    ) -> Result<R, SyncManagerError> {
        let (tx, rx) = oneshot::channel();
        self.send(SyncEvent::Command(command(tx))).await?;
        rx.await.map_err(|_| SyncManagerError::ManagerStopped)
    }

    /// Tells the sync manager about a newly connected peer.
    pub async fn new_peer(&self, client: PeerClient) -> Result<(), SyncManagerError> {
        self.send(SyncEvent::PeerConnected(client)).await
    }

    /// Tells the sync manager a peer disconnected.
    pub async fn done_peer(&self, peer: PeerId) -> Result<(), SyncManagerError> {
        self.send(SyncEvent::PeerDisconnected(peer)).await
    }

    /// Queues a `headers` message from a peer.
    pub async fn queue_headers(
        &self,
        peer: PeerId,
        headers: Vec<BlockHeader>,
    ) -> Result<(), SyncManagerError> {
        self.send(SyncEvent::HeadersReceived { peer, headers }).await
    }

    /// Queues a block from a peer.
    ///
    /// The returned receiver completes once the block has been handled, peers should not be read
    /// from until then.
    pub async fn queue_block(
        &self,
        peer: PeerId,
        block: Arc<Block>,
    ) -> Result<oneshot::Receiver<()>, SyncManagerError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(SyncEvent::BlockReceived {
            peer,
            block,
            done_tx,
        })
        .await?;
        Ok(done_rx)
    }

    /// Queues an `inv` message from a peer.
    pub async fn queue_inv(&self, peer: PeerId, inv: Vec<InvVect>) -> Result<(), SyncManagerError> {
        self.send(SyncEvent::InvReceived { peer, inv }).await
    }

    /// Queues a transaction from a peer.
    ///
    /// The returned receiver completes once the transaction has been handled.
    pub async fn queue_tx(
        &self,
        peer: PeerId,
        tx: Arc<Transaction>,
    ) -> Result<oneshot::Receiver<()>, SyncManagerError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(SyncEvent::TxReceived { peer, tx, done_tx })
            .await?;
        Ok(done_rx)
    }

    /// Queues a `notfound` message from a peer.
    pub async fn queue_not_found(
        &self,
        peer: PeerId,
        inv: Vec<InvVect>,
    ) -> Result<(), SyncManagerError> {
        self.send(SyncEvent::NotFoundReceived { peer, inv }).await
    }

    /// Asks the sync manager to look for blocks and transactions to request.
    pub async fn request_rescan(&self) -> Result<(), SyncManagerError> {
        self.send(SyncEvent::RescanRequested).await
    }

    /// Returns the current sync peer.
    pub async fn sync_peer_id(&self) -> Result<Option<PeerId>, SyncManagerError> {
        self.command(SyncCommand::SyncPeerId).await
    }

    /// Processes a block that did not come from a peer, such as one we mined.
    ///
    /// Returns `true` if the block is an orphan.
    ///
    /// # Errors
    ///
    /// Returns [`SyncManagerError::Chain`] if the block is invalid or already known.
    pub async fn process_block(
        &self,
        block: Arc<Block>,
        flags: BehaviorFlags,
    ) -> Result<bool, SyncManagerError> {
        Ok(self
            .command(|response_tx| SyncCommand::ProcessBlock {
                block,
                flags,
                response_tx,
            })
            .await??)
    }

    /// Returns `true` if we believe we are synced with our peers.
    pub async fn is_current(&self) -> Result<bool, SyncManagerError> {
        self.command(SyncCommand::IsCurrent).await
    }

    /// Pauses the sync manager, it will not handle any event until the returned guard is dropped.
    pub async fn pause(&self) -> Result<PauseGuard, SyncManagerError> {
        let (resume_tx, resume_rx) = oneshot::channel();

        self.command(|paused_tx| SyncCommand::Pause {
            paused_tx,
            resume_rx,
        })
        .await?;

        Ok(PauseGuard {
            _resume_tx: resume_tx,
        })
    }
}

/// Keeps the sync manager paused, dropping it resumes the sync manager.
#[derive(Debug)]
#[must_use = "dropping the guard resumes the sync manager"]
pub struct PauseGuard {
    _resume_tx: oneshot::Sender<()>,
}

//! # Sync Manager
//!
//! The sync manager is a single task that owns all sync state. Peers' messages, connection events
//! and commands are queued on its event channel and handled one at a time, in order.
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use indexmap::IndexSet;
use tokio::{
    sync::{mpsc, oneshot},
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceExt};

use ohmc_p2p_core::{PeerId, PeerNotifier, PeerRequestError};
use ohmc_types::{
    chain::{BehaviorFlags, BestState, ChainError, ChainRequest, ChainResponse},
    txpool::{TxDesc, TxPoolError, TxPoolRequest, TxPoolResponse},
    Block, BoxError, Transaction,
};

use crate::{
    checkpoint::CheckpointGate,
    constants::MIN_STALL_TICK_INTERVAL,
    error::Misbehaviour,
    interface::FeeEstimator,
    orphan_pool::OrphanPool,
    peer_state::PeerSyncState,
    progress::BlockProgressLogger,
    scheduler::{HeaderList, HeaderNode},
    stall::StallDetector,
    SyncError, SyncManagerConfig,
};

pub(crate) mod commands;
mod handler;
#[cfg(test)]
mod tests;

use commands::SyncEvent;

/// The sync manager.
///
/// Downloads blocks from peers, first the headers up to the next checkpoint and then the blocks for
/// them from every peer that has them, or block by block from a single sync peer once past the last
/// checkpoint. Transactions announced by peers are fetched and given to the transaction pool.
pub(crate) struct SyncManager<C, T> {
    config: SyncManagerConfig,

    /// The chain service, which validates blocks and owns the main chain.
    chain: C,
    /// The transaction pool service.
    txpool: T,
    /// Used to tell peers about new blocks and transactions.
    notifier: Box<dyn PeerNotifier>,
    /// Told about every block connected to the main chain, dropped if it errors.
    fee_estimator: Option<Box<dyn FeeEstimator>>,

    /// The connected peers.
    peers: BTreeMap<PeerId, PeerSyncState>,
    /// The peer we are syncing from.
    sync_peer: Option<PeerId>,

    /// Every block in flight, with the peer it was requested from.
    requested_blocks: HashMap<[u8; 32], PeerId>,
    /// Every transaction in flight, with the peer it was requested from.
    requested_txns: HashMap<[u8; 32], PeerId>,
    /// Recently rejected transactions, oldest first.
    rejected_txns: IndexSet<[u8; 32]>,

    orphans: OrphanPool,

    /// `true` while downloading the headers, then blocks, up to the next checkpoint.
    headers_first_mode: bool,
    /// The headers downloaded in headers-first mode.
    header_list: HeaderList,
    checkpoints: CheckpointGate,

    stall_detector: StallDetector,
    progress: BlockProgressLogger,

    /// Set when the sync peer was removed and another should be picked.
    needs_sync_peer: bool,
    /// Set when in-flight blocks were released and should be requested again.
    blocks_released: bool,
    /// Completed once the current event, and anything it set off, is handled.
    done_txs: Vec<oneshot::Sender<()>>,

    shutdown: CancellationToken,
}

impl<C, T> SyncManager<C, T>
where
    C: Service<ChainRequest, Response = ChainResponse, Error = ChainError>,
    T: Service<TxPoolRequest, Response = TxPoolResponse, Error = TxPoolError>,
{
    pub(crate) fn new(
        config: SyncManagerConfig,
        chain: C,
        txpool: T,
        notifier: Box<dyn PeerNotifier>,
        fee_estimator: Option<Box<dyn FeeEstimator>>,
        shutdown: CancellationToken,
    ) -> Self {
        let now = Instant::now();

        Self {
            checkpoints: CheckpointGate::new(config.chain_params(), 0),
            orphans: OrphanPool::new(config.max_orphan_blocks, config.orphan_expiry),
            stall_detector: StallDetector::new(config.stall_timeout),
            progress: BlockProgressLogger::new(config.progress_log_interval, now),
            rejected_txns: IndexSet::with_capacity(config.max_rejected_txns),
            config,
            chain,
            txpool,
            notifier,
            fee_estimator,
            peers: BTreeMap::new(),
            sync_peer: None,
            requested_blocks: HashMap::new(),
            requested_txns: HashMap::new(),
            headers_first_mode: false,
            header_list: HeaderList::default(),
            needs_sync_peer: false,
            blocks_released: false,
            done_txs: Vec::new(),
            shutdown,
        }
    }

    /// Runs the sync manager until the shutdown token is cancelled or every handle is dropped.
    pub(crate) async fn run(mut self, mut event_rx: mpsc::Receiver<SyncEvent>) {
        match self.best_state().await {
            Ok(best) => self.reset_header_state(best),
            Err(e) => {
                tracing::error!("Failed to get the chain tip, sync manager exiting: {e}");
                return;
            }
        }

        tracing::info!("Starting sync manager.");

        let tick = self
            .config
            .stall_tick_interval
            .max(MIN_STALL_TICK_INTERVAL);
        let mut stall_ticker = interval_at(Instant::now() + tick, tick);
        stall_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown = self.shutdown.clone();

        loop {
            let res = tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    tracing::info!("Shutting down sync manager.");
                    return;
                }
                event = event_rx.recv() => {
                    let Some(event) = event else {
                        tracing::info!("Sync manager handles dropped, shutting down.");
                        return;
                    };

                    self.handle_event(event).await
                }
                _ = stall_ticker.tick() => self.handle_stall_sample().await,
            };

            if let Err(e) = res {
                tracing::error!("Service error in sync manager: {e}");
            }

            if let Err(e) = self.settle().await {
                tracing::error!("Service error in sync manager: {e}");
            }

            for done_tx in self.done_txs.drain(..) {
                let _ = done_tx.send(());
            }
        }
    }

    async fn handle_event(&mut self, event: SyncEvent) -> Result<(), BoxError> {
        match event {
            SyncEvent::PeerConnected(client) => self.handle_new_peer(client).await,
            SyncEvent::PeerDisconnected(peer) => {
                self.handle_done_peer(peer);
                Ok(())
            }
            SyncEvent::HeadersReceived { peer, headers } => {
                self.handle_headers(peer, headers).await
            }
            SyncEvent::BlockReceived {
                peer,
                block,
                done_tx,
            } => {
                self.done_txs.push(done_tx);
                self.handle_block(peer, block).await
            }
            SyncEvent::InvReceived { peer, inv } => self.handle_inv(peer, inv).await,
            SyncEvent::TxReceived { peer, tx, done_tx } => {
                self.done_txs.push(done_tx);
                self.handle_tx(peer, tx).await
            }
            SyncEvent::NotFoundReceived { peer, inv } => {
                self.handle_not_found(peer, &inv);
                Ok(())
            }
            SyncEvent::RescanRequested => self.handle_rescan().await,
            SyncEvent::Command(command) => self.handle_command(command).await,
        }
    }

    /// Picks a new sync peer and re-requests released blocks, if an earlier event asked for it.
    ///
    /// Both can drop peers whose request channel is full, so this loops until nothing is left to do.
    /// Each round either finishes or removes a peer.
    async fn settle(&mut self) -> Result<(), BoxError> {
        loop {
            if std::mem::take(&mut self.needs_sync_peer) && self.sync_peer.is_none() {
                self.start_sync(None).await?;
            }

            if std::mem::take(&mut self.blocks_released) {
                self.fetch_header_blocks().await?;
            }

            if !self.needs_sync_peer && !self.blocks_released {
                return Ok(());
            }
        }
    }

    /// Clears the header list and moves the checkpoint to the first one above `best`.
    fn reset_header_state(&mut self, best: BestState) {
        self.headers_first_mode = false;
        self.header_list.clear();

        if self.checkpoints.reset(best.height).is_some() {
            self.header_list.reset(HeaderNode {
                height: best.height,
                hash: best.hash,
            });
        }
    }

    /// Removes a peer's state, releasing its in-flight requests.
    ///
    /// If it was the sync peer another is picked once the current event is handled.
    fn remove_peer(&mut self, peer: PeerId) -> Option<PeerSyncState> {
        let mut state = self.peers.remove(&peer)?;

        self.clear_requested_state(&mut state);

        if self.sync_peer == Some(peer) {
            self.sync_peer = None;
            self.needs_sync_peer = true;
        }

        Some(state)
    }

    /// Releases every request in flight to this peer.
    fn clear_requested_state(&mut self, state: &mut PeerSyncState) {
        let peer = state.id();

        for hash in state.requested_txns.drain() {
            if self.requested_txns.get(&hash) == Some(&peer) {
                self.requested_txns.remove(&hash);
            }
        }

        if state.requested_blocks.is_empty() {
            return;
        }

        for hash in state.requested_blocks.drain() {
            if self.requested_blocks.get(&hash) == Some(&peer) {
                self.requested_blocks.remove(&hash);
            }
        }

        self.blocks_released = true;
    }

    /// Disconnects, or bans, a peer that broke the protocol and removes its state.
    fn disconnect_peer(&mut self, peer: PeerId, err: &SyncError) {
        let Some(state) = self.peers.get(&peer) else {
            return;
        };

        let handle = &state.client.info.handle;
        match err.misbehaviour() {
            Misbehaviour::Disconnect => {
                tracing::info!("Disconnecting peer {peer}: {err}");
                handle.send_close_signal();
            }
            Misbehaviour::Ban(time) => {
                tracing::warn!("Banning peer {peer} for {time:?}: {err}");
                handle.ban_peer(time);
            }
        }

        self.remove_peer(peer);
    }

    /// Handles a failed request to a peer.
    fn request_failed(&mut self, peer: PeerId, err: PeerRequestError) {
        match err {
            PeerRequestError::ChannelFull => {
                self.disconnect_peer(peer, &SyncError::PeerRequestChannelFull);
            }
            PeerRequestError::ChannelClosed => {
                tracing::debug!("Peer {peer} connection task has exited, removing.");
                self.remove_peer(peer);
            }
        }
    }

    /// Remembers a rejected transaction, forgetting the oldest if the cache is full.
    fn reject_tx(&mut self, hash: [u8; 32]) {
        if self.config.max_rejected_txns == 0 {
            return;
        }

        if self.rejected_txns.len() >= self.config.max_rejected_txns {
            self.rejected_txns.shift_remove_index(0);
        }

        self.rejected_txns.insert(hash);
    }

    /// Returns `true` if we believe we are synced with our peers.
    ///
    /// The chain must think it is current, and we must have every block our sync peer has.
    async fn current(&mut self) -> Result<bool, ChainError> {
        if !self.chain_is_current().await? {
            return Ok(false);
        }

        let Some(sync_peer) = self.sync_peer else {
            return Ok(true);
        };

        let Some(state) = self.peers.get(&sync_peer) else {
            return Ok(true);
        };
        let peer_height = state.last_block;

        Ok(self.best_state().await?.height >= peer_height)
    }

    //------------------------------------------------------------------------------------------------- Chain

    async fn chain_request(&mut self, req: ChainRequest) -> Result<ChainResponse, ChainError> {
        self.chain.ready().await?.call(req).await
    }

    async fn best_state(&mut self) -> Result<BestState, ChainError> {
        let ChainResponse::BestSnapshot(best) =
            self.chain_request(ChainRequest::BestSnapshot).await?
        else {
            unreachable!("Chain service returned wrong response!");
        };

        Ok(best)
    }

    async fn have_block(&mut self, hash: [u8; 32]) -> Result<bool, ChainError> {
        let ChainResponse::HaveBlock(have) =
            self.chain_request(ChainRequest::HaveBlock(hash)).await?
        else {
            unreachable!("Chain service returned wrong response!");
        };

        Ok(have)
    }

    async fn block_height(&mut self, hash: [u8; 32]) -> Result<Option<u64>, ChainError> {
        let ChainResponse::BlockHeight(height) =
            self.chain_request(ChainRequest::BlockHeight(hash)).await?
        else {
            unreachable!("Chain service returned wrong response!");
        };

        Ok(height)
    }

    async fn latest_block_locator(&mut self) -> Result<Vec<[u8; 32]>, ChainError> {
        let ChainResponse::BlockLocator(locator) =
            self.chain_request(ChainRequest::LatestBlockLocator).await?
        else {
            unreachable!("Chain service returned wrong response!");
        };

        Ok(locator)
    }

    async fn block_locator_from_hash(
        &mut self,
        hash: [u8; 32],
    ) -> Result<Vec<[u8; 32]>, ChainError> {
        let ChainResponse::BlockLocator(locator) = self
            .chain_request(ChainRequest::BlockLocatorFromHash(hash))
            .await?
        else {
            unreachable!("Chain service returned wrong response!");
        };

        Ok(locator)
    }

    async fn chain_is_current(&mut self) -> Result<bool, ChainError> {
        let ChainResponse::IsCurrent(current) = self.chain_request(ChainRequest::IsCurrent).await?
        else {
            unreachable!("Chain service returned wrong response!");
        };

        Ok(current)
    }

    /// Gives headers to the chain, returning how many were accepted.
    async fn chain_process_headers(
        &mut self,
        headers: Vec<ohmc_types::BlockHeader>,
    ) -> Result<usize, ChainError> {
        let ChainResponse::HeadersAccepted(count) = self
            .chain_request(ChainRequest::ProcessHeaders(headers))
            .await?
        else {
            unreachable!("Chain service returned wrong response!");
        };

        Ok(count)
    }

    /// Gives a block to the chain, returning `true` if it is an orphan.
    async fn chain_process_block(
        &mut self,
        block: Arc<Block>,
        flags: BehaviorFlags,
    ) -> Result<bool, ChainError> {
        let ChainResponse::BlockProcessed { is_orphan } = self
            .chain_request(ChainRequest::ProcessBlock { block, flags })
            .await?
        else {
            unreachable!("Chain service returned wrong response!");
        };

        Ok(is_orphan)
    }

    //------------------------------------------------------------------------------------------------- TxPool

    async fn txpool_request(
        &mut self,
        req: TxPoolRequest,
    ) -> Result<TxPoolResponse, TxPoolError> {
        self.txpool.ready().await?.call(req).await
    }

    /// Gives a transaction to the pool, returning every transaction it accepted.
    async fn txpool_process_tx(&mut self, tx: Arc<Transaction>) -> Result<Vec<TxDesc>, TxPoolError> {
        let TxPoolResponse::Accepted(accepted) = self
            .txpool_request(TxPoolRequest::ProcessTransaction(tx))
            .await?
        else {
            unreachable!("TxPool service returned wrong response!");
        };

        Ok(accepted)
    }

    async fn txpool_have_tx(&mut self, hash: [u8; 32]) -> Result<bool, TxPoolError> {
        let TxPoolResponse::HaveTransaction(have) = self
            .txpool_request(TxPoolRequest::HaveTransaction(hash))
            .await?
        else {
            unreachable!("TxPool service returned wrong response!");
        };

        Ok(have)
    }

    /// Tells the pool about a block connected to the main chain, returning orphan transactions it
    /// accepted because of it.
    async fn txpool_block_connected(
        &mut self,
        block: Arc<Block>,
    ) -> Result<Vec<TxDesc>, TxPoolError> {
        let TxPoolResponse::Accepted(accepted) = self
            .txpool_request(TxPoolRequest::BlockConnected(block))
            .await?
        else {
            unreachable!("TxPool service returned wrong response!");
        };

        Ok(accepted)
    }
}

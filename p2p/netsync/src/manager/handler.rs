use std::{cmp::Ordering, sync::Arc};

use tokio::time::Instant;
use tower::Service;

use ohmc_p2p_core::{PeerClient, PeerId, RelayData};
use ohmc_types::{
    chain::{BehaviorFlags, ChainError, ChainRequest, ChainResponse},
    txpool::{TxPoolError, TxPoolRequest, TxPoolResponse},
    Block, BlockHeader, BoxError, InvVect, Transaction, ZERO_HASH,
};

use crate::{
    constants::MAX_HEADERS_PER_MSG,
    manager::commands::SyncCommand,
    peer_state::{is_sync_candidate, PeerSyncState},
    scheduler::{assign_block_requests, pick_sync_peer, HeaderNode, PeerSlot},
    stall::StallVerdict,
    SyncError,
};

/// The result of giving a block to the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
enum BlockOutcome {
    /// The block was added to the chain, along with any orphans that build on it.
    Committed,
    /// The block's parent is unknown, it was added to the orphan pool.
    Orphan,
    /// We already have the block.
    Duplicate,
    /// The block broke a consensus rule.
    Invalid(String),
}

impl<C, T> super::SyncManager<C, T>
where
    C: Service<ChainRequest, Response = ChainResponse, Error = ChainError>,
    T: Service<TxPoolRequest, Response = TxPoolResponse, Error = TxPoolError>,
{
    //------------------------------------------------------------------------------------------------- Peers

    /// Handles a newly connected peer, starting a sync if we have no sync peer.
    pub(super) async fn handle_new_peer(&mut self, client: PeerClient) -> Result<(), BoxError> {
        let peer = client.info.id;

        if client.info.handle.is_closed() {
            tracing::debug!("Peer {peer} disconnected before it was added.");
            return Ok(());
        }

        if self.peers.contains_key(&peer) {
            tracing::warn!("Peer {peer} connected twice, replacing the old state.");
            self.remove_peer(peer);
        }

        let sync_candidate = is_sync_candidate(&client.info, self.checkpoints.params().is_regtest());

        tracing::info!("New valid peer {peer}, height: {}", client.info.starting_height);

        self.peers.insert(
            peer,
            PeerSyncState::new(client, sync_candidate, Instant::now()),
        );

        if !sync_candidate {
            return Ok(());
        }

        if self.sync_peer.is_none() {
            self.start_sync(None).await
        } else {
            self.replace_idle_sync_peer().await
        }
    }

    /// Handles a disconnected peer.
    ///
    /// A new sync peer is picked, and the peer's in-flight blocks re-requested, once the event is handled.
    pub(super) fn handle_done_peer(&mut self, peer: PeerId) {
        if self.remove_peer(peer).is_none() {
            tracing::debug!("Received done peer message for unknown peer {peer}");
            return;
        }

        tracing::info!("Lost peer {peer}");
    }

    /// Picks a sync peer and starts downloading from it.
    ///
    /// Peers ahead of us are preferred, then peers at our height. `exclude` is only picked if no
    /// other peer can be.
    pub(super) async fn start_sync(&mut self, exclude: Option<PeerId>) -> Result<(), BoxError> {
        if self.sync_peer.is_some() {
            return Ok(());
        }

        let best = self.best_state().await?;

        let (mut higher, mut equal) = self.sync_candidates(best.height, exclude);
        if higher.is_empty() && equal.is_empty() && exclude.is_some() {
            (higher, equal) = self.sync_candidates(best.height, None);
        }

        if higher.is_empty() && self.chain_is_current().await? {
            tracing::debug!(
                "Caught up to block {}, height {}",
                hex::encode(best.hash),
                best.height
            );
            return Ok(());
        }

        let picked = {
            let mut rng = rand::thread_rng();
            pick_sync_peer(&higher, &equal, &mut rng)
        };
        let Some(peer) = picked else {
            tracing::debug!("No sync peer candidates available.");
            return Ok(());
        };

        self.reset_header_state(best);
        let locator = self.latest_block_locator().await?;

        let Some(state) = self.peers.get_mut(&peer) else {
            return Ok(());
        };

        tracing::info!(
            "Syncing to block height {} from peer {peer}",
            state.last_block
        );

        state.last_block_time = Instant::now();
        state.client.forget_last_requests();
        self.sync_peer = Some(peer);

        let res = match self.checkpoints.next() {
            Some(cp) if self.checkpoints.headers_first(best.height) => {
                tracing::info!(
                    "Downloading headers for blocks {} to {} from peer {peer}",
                    best.height + 1,
                    cp.height
                );

                self.headers_first_mode = true;
                state.client.push_get_headers(locator, cp.hash)
            }
            _ => state.client.push_get_blocks(locator, ZERO_HASH),
        };

        if let Err(e) = res {
            self.request_failed(peer, e);
        }

        Ok(())
    }

    /// Returns the sync candidates ahead of `our_height`, with their heights, and the candidates at
    /// `our_height`.
    fn sync_candidates(
        &self,
        our_height: u64,
        exclude: Option<PeerId>,
    ) -> (Vec<(PeerId, u64)>, Vec<PeerId>) {
        let mut higher = Vec::new();
        let mut equal = Vec::new();

        for (id, state) in &self.peers {
            if !state.sync_candidate || Some(*id) == exclude {
                continue;
            }

            match state.last_block.cmp(&our_height) {
                Ordering::Greater => higher.push((*id, state.last_block)),
                Ordering::Equal => equal.push(*id),
                Ordering::Less => (),
            }
        }

        (higher, equal)
    }

    //------------------------------------------------------------------------------------------------- Headers

    /// Handles a `headers` message received during headers-first sync.
    pub(super) async fn handle_headers(
        &mut self,
        peer: PeerId,
        headers: Vec<BlockHeader>,
    ) -> Result<(), BoxError> {
        if !self.peers.contains_key(&peer) {
            tracing::debug!("Received headers from unknown peer {peer}");
            return Ok(());
        }

        if !self.headers_first_mode || self.sync_peer != Some(peer) {
            self.disconnect_peer(peer, &SyncError::UnrequestedHeaders);
            return Ok(());
        }

        if headers.is_empty() {
            return Ok(());
        }

        if headers.len() > MAX_HEADERS_PER_MSG {
            self.disconnect_peer(peer, &SyncError::TooManyHeaders(headers.len()));
            return Ok(());
        }

        if self
            .header_list
            .last()
            .zip(self.checkpoints.next())
            .is_some_and(|(last, cp)| last.height >= cp.height)
        {
            tracing::debug!("Ignoring headers from {peer} past the checkpoint.");
            return Ok(());
        }

        let mut nodes = match self.header_list.connect(&headers) {
            Ok(nodes) => nodes,
            Err(e) => {
                self.disconnect_peer(peer, &e);
                return Ok(());
            }
        };

        // Check the whole batch against the checkpoint before touching any state.
        let mut checkpoint_idx = None;
        for (i, node) in nodes.iter().enumerate() {
            match self.checkpoints.check_header(node.height, node.hash) {
                Ok(false) => (),
                Ok(true) => {
                    checkpoint_idx = Some(i);
                    break;
                }
                Err(e) => {
                    self.disconnect_peer(peer, &e);
                    return Ok(());
                }
            }
        }

        // Headers past the checkpoint are dropped, they are requested again in the next round.
        let mut headers = headers;
        if let Some(i) = checkpoint_idx {
            headers.truncate(i + 1);
            nodes.truncate(i + 1);
        }

        match self.chain_process_headers(headers).await {
            Ok(_) | Err(ChainError::Duplicate) => (),
            Err(ChainError::Rule(reason)) => {
                self.disconnect_peer(peer, &SyncError::InvalidBlock(reason));
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let Some(last) = nodes.last().copied() else {
            return Ok(());
        };
        self.header_list.extend(nodes);

        let Some(state) = self.peers.get_mut(&peer) else {
            return Ok(());
        };
        state.last_block_time = Instant::now();

        if checkpoint_idx.is_some() {
            tracing::info!(
                "Verified downloaded block header against checkpoint at height {}, hash {}",
                last.height,
                hex::encode(last.hash)
            );
            tracing::info!(
                "Received {} block headers: Fetching blocks",
                self.header_list.len() - 1
            );

            self.progress.set_last_log_time(Instant::now());
            return self.fetch_header_blocks().await;
        }

        let Some(cp) = self.checkpoints.next() else {
            return Ok(());
        };

        if let Err(e) = state.client.push_get_headers(vec![last.hash], cp.hash) {
            self.request_failed(peer, e);
        }

        Ok(())
    }

    /// Requests the blocks for the downloaded headers, spread over the sync peer and other peers.
    ///
    /// Only blocks in the window above our tip, that we don't have and have not requested, are
    /// requested. Does nothing until every header up to the checkpoint has been downloaded.
    pub(super) async fn fetch_header_blocks(&mut self) -> Result<(), BoxError> {
        if !self.headers_first_mode {
            return Ok(());
        }

        let (Some(cp), Some(last)) = (self.checkpoints.next(), self.header_list.last()) else {
            return Ok(());
        };
        if last.height != cp.height {
            return Ok(());
        }
        let cp_height = cp.height;

        let best = self.best_state().await?;
        let window_end =
            cp_height.min(best.height + u64::try_from(self.config.max_orphan_blocks)?);

        let mut wanted = Vec::new();
        for height in best.height + 1..=window_end {
            let Some(node) = self.header_list.get(height).copied() else {
                continue;
            };

            if self.requested_blocks.contains_key(&node.hash)
                || self.orphans.has(&node.hash)
                || self.have_block(node.hash).await?
            {
                continue;
            }

            wanted.push(node);
        }

        if wanted.is_empty() {
            return Ok(());
        }

        let max_in_flight = self.config.max_blocks_in_flight_per_peer;
        let mut slots = self
            .sync_peer
            .into_iter()
            .chain(self.peers.keys().copied().filter(|id| Some(*id) != self.sync_peer))
            .filter_map(|id| {
                let state = self.peers.get(&id)?;
                state.sync_candidate.then_some(PeerSlot {
                    id,
                    known_height: state.last_block,
                    free: max_in_flight.saturating_sub(state.requested_blocks.len()),
                })
            })
            .collect::<Vec<_>>();

        let plan = assign_block_requests(&wanted, &mut slots, |id, hash| {
            self.peers
                .get(id)
                .is_some_and(|state| state.not_found_blocks.contains(hash))
        });

        for (peer, hashes) in plan {
            let Some(state) = self.peers.get_mut(&peer) else {
                continue;
            };

            let inv_type = state.block_inv_type();
            for hash in &hashes {
                state.requested_blocks.insert(*hash);
                self.requested_blocks.insert(*hash, peer);
            }

            tracing::debug!("Requesting {} blocks from peer {peer}", hashes.len());

            let invs = hashes
                .into_iter()
                .map(|hash| InvVect { inv_type, hash })
                .collect::<Vec<_>>();

            let res = invs
                .chunks(self.config.max_inv_per_msg.max(1))
                .try_for_each(|chunk| state.client.queue_get_data(chunk.to_vec()));

            if let Err(e) = res {
                self.request_failed(peer, e);
            }
        }

        Ok(())
    }

    //------------------------------------------------------------------------------------------------- Blocks

    /// Returns the flags to process a block with.
    fn block_flags(&self, hash: &[u8; 32]) -> BehaviorFlags {
        if self.headers_first_mode && self.header_list.contains(hash) {
            BehaviorFlags::FAST_ADD
        } else {
            BehaviorFlags::NONE
        }
    }

    /// Handles a block from a peer.
    pub(super) async fn handle_block(
        &mut self,
        peer: PeerId,
        block: Arc<Block>,
    ) -> Result<(), BoxError> {
        let hash = block.hash();

        let Some(state) = self.peers.get_mut(&peer) else {
            tracing::debug!("Received block from unknown peer {peer}");
            return Ok(());
        };

        if !state.requested_blocks.remove(&hash) && !self.config.accept_unrequested_blocks {
            self.disconnect_peer(peer, &SyncError::UnrequestedBlock);
            return Ok(());
        }

        if let Some(owner) = self.requested_blocks.remove(&hash) {
            if owner != peer {
                if let Some(owner_state) = self.peers.get_mut(&owner) {
                    owner_state.requested_blocks.remove(&hash);
                }
            }
        }

        let flags = self.block_flags(&hash);

        match self.process_new_block(Arc::clone(&block), Some(peer), flags).await? {
            BlockOutcome::Committed => {
                if let Some(state) = self.peers.get_mut(&peer) {
                    state.last_block_time = Instant::now();
                }
            }
            BlockOutcome::Orphan => {
                if let Some(state) = self.peers.get_mut(&peer) {
                    state.last_block_time = Instant::now();
                }
                self.request_orphan_parents(peer, hash).await?;
            }
            BlockOutcome::Duplicate => (),
            BlockOutcome::Invalid(reason) => {
                self.disconnect_peer(peer, &SyncError::InvalidBlock(reason));
            }
        }

        self.check_headers_first_progress(Some(peer)).await
    }

    /// Gives a block to the chain, orphaning it if its parent is unknown and connecting any orphans
    /// that build on it.
    async fn process_new_block(
        &mut self,
        block: Arc<Block>,
        supplier: Option<PeerId>,
        flags: BehaviorFlags,
    ) -> Result<BlockOutcome, ChainError> {
        let hash = block.hash();

        if self.orphans.has(&hash) && !self.have_block(block.previous()).await? {
            tracing::trace!("Already have orphan block {}", hex::encode(hash));
            return Ok(BlockOutcome::Duplicate);
        }

        if self.have_block(hash).await? {
            tracing::trace!("Already have block {}", hex::encode(hash));
            return Ok(BlockOutcome::Duplicate);
        }

        // An orphan whose parent has since been committed, take it out of the pool and process it.
        self.orphans.remove(&hash);

        let is_orphan = if self.have_block(block.previous()).await? {
            match self.chain_process_block(Arc::clone(&block), flags).await {
                Ok(is_orphan) => is_orphan,
                Err(ChainError::Duplicate) => return Ok(BlockOutcome::Duplicate),
                Err(ChainError::Rule(reason)) => {
                    tracing::info!("Rejected block {}: {reason}", hex::encode(hash));
                    return Ok(BlockOutcome::Invalid(reason));
                }
                Err(e) => return Err(e),
            }
        } else {
            true
        };

        if is_orphan {
            self.add_orphan(block, supplier);
            return Ok(BlockOutcome::Orphan);
        }

        self.block_committed(&block, supplier).await?;
        self.process_orphans(hash).await?;

        Ok(BlockOutcome::Committed)
    }

    fn add_orphan(&mut self, block: Arc<Block>, supplier: Option<PeerId>) {
        tracing::debug!(
            "Adding orphan block {} with parent {}",
            hex::encode(block.hash()),
            hex::encode(block.previous())
        );

        if let Some(evicted) = self.orphans.add(block, supplier, Instant::now()) {
            tracing::debug!("Evicted orphan block {}", hex::encode(evicted));
        }
    }

    /// Connects every orphan that builds on `parent`, then on those orphans, and so on.
    async fn process_orphans(&mut self, parent: [u8; 32]) -> Result<(), ChainError> {
        let mut parents = vec![parent];

        while let Some(parent) = parents.pop() {
            let mut children = self.orphans.remove_by_parent(&parent).into_iter();

            while let Some(orphan) = children.next() {
                let hash = orphan.block.hash();
                let flags = self.block_flags(&hash);

                match self
                    .chain_process_block(Arc::clone(&orphan.block), flags)
                    .await
                {
                    Ok(false) => {
                        tracing::debug!(
                            "Connected orphan block {}, held for {:?}",
                            hex::encode(hash),
                            orphan.received.elapsed()
                        );
                        parents.push(hash);

                        if let Err(e) = self.block_committed(&orphan.block, orphan.supplier).await {
                            children.for_each(|orphan| {
                                self.orphans.restore(orphan);
                            });
                            return Err(e);
                        }
                    }
                    Ok(true) => self.add_orphan(orphan.block, orphan.supplier),
                    Err(ChainError::Duplicate) => (),
                    Err(ChainError::Rule(reason)) => {
                        tracing::info!("Rejected orphan block {}: {reason}", hex::encode(hash));
                        if let Some(supplier) = orphan.supplier {
                            self.disconnect_peer(supplier, &SyncError::InvalidBlock(reason));
                        }
                    }
                    Err(e) => {
                        // Put back what is left, each is retried when received again.
                        for orphan in std::iter::once(orphan).chain(children) {
                            self.orphans.restore(orphan);
                        }
                        return Err(e);
                    }
                }
            }
        }

        Ok(())
    }

    /// Everything that happens after a block is added to the chain.
    async fn block_committed(
        &mut self,
        block: &Arc<Block>,
        supplier: Option<PeerId>,
    ) -> Result<(), ChainError> {
        let hash = block.hash();
        let best = self.best_state().await?;
        let height = self.block_height(hash).await?.unwrap_or(best.height);
        let now = Instant::now();

        for state in self.peers.values_mut() {
            if state.last_announced_block == Some(hash) {
                state.update_last_block_height(height);
                state.last_announced_block = None;
            }
        }

        if let Some(state) = supplier.and_then(|peer| self.peers.get_mut(&peer)) {
            state.update_last_block_height(height);
        }

        if best.hash == hash {
            self.progress.log_block_height(block, height, now);
            self.rejected_txns.clear();

            if self.headers_first_mode {
                self.header_list.prune_below(height);
            }

            self.main_chain_connected(block).await;
        }

        if self.current().await? {
            self.notifier.relay_inventory(
                InvVect::block(hash),
                RelayData::BlockHeader(block.header),
            );

            if let Some(supplier) = supplier {
                self.notifier.update_peer_heights(&hash, height, &supplier);
            }
        }

        Ok(())
    }

    /// Tells the transaction pool, fee estimator and peers about a block connected to the main chain.
    async fn main_chain_connected(&mut self, block: &Arc<Block>) {
        match self.txpool_block_connected(Arc::clone(block)).await {
            Ok(accepted) if !accepted.is_empty() => {
                self.notifier.announce_new_transactions(&accepted);
            }
            Ok(_) => (),
            Err(e) => tracing::error!("Transaction pool failed to handle connected block: {e}"),
        }

        for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
            self.notifier.transaction_confirmed(tx);
        }

        if let Some(estimator) = &mut self.fee_estimator {
            if let Err(e) = estimator.register_block(block) {
                tracing::warn!("Fee estimator failed to register block, disabling it: {e}");
                self.fee_estimator = None;
            }
        }
    }

    /// Asks the peer for the blocks between our tip and the oldest orphan that `hash` builds on.
    async fn request_orphan_parents(
        &mut self,
        peer: PeerId,
        hash: [u8; 32],
    ) -> Result<(), BoxError> {
        let root = self.orphans.orphan_root(&hash);

        if let Some(parent) = self.orphans.parent_of(&root) {
            if self.requested_blocks.contains_key(&parent) {
                tracing::trace!(
                    "Parent {} of orphan {} already requested",
                    hex::encode(parent),
                    hex::encode(root)
                );
                return Ok(());
            }
        }

        let locator = self.latest_block_locator().await?;

        let Some(state) = self.peers.get(&peer) else {
            return Ok(());
        };

        if let Err(e) = state.client.push_get_blocks(locator, root) {
            self.request_failed(peer, e);
        }

        Ok(())
    }

    /// Moves headers-first sync on once a checkpoint is reached, otherwise requests more blocks from
    /// `supplier` if it is running low.
    async fn check_headers_first_progress(
        &mut self,
        supplier: Option<PeerId>,
    ) -> Result<(), BoxError> {
        if !self.headers_first_mode {
            return Ok(());
        }

        let Some(cp_height) = self.checkpoints.next().map(|cp| cp.height) else {
            return Ok(());
        };

        let best = self.best_state().await?;

        if best.height < cp_height {
            let running_low = supplier
                .and_then(|peer| self.peers.get(&peer))
                .is_some_and(|state| {
                    state.requested_blocks.len() < self.config.min_in_flight_blocks
                });

            if running_low {
                self.fetch_header_blocks().await?;
            }

            return Ok(());
        }

        let next = self.checkpoints.reset(best.height).copied();
        let sync_peer = self.sync_peer.and_then(|peer| self.peers.get(&peer));

        let res = match next {
            Some(next) => {
                self.header_list.reset(HeaderNode {
                    height: best.height,
                    hash: best.hash,
                });

                let Some(state) = sync_peer else {
                    return Ok(());
                };

                tracing::info!(
                    "Downloading headers for blocks {} to {} from peer {}",
                    best.height + 1,
                    next.height,
                    state.id()
                );

                state.client.push_get_headers(vec![best.hash], next.hash)
            }
            None => {
                tracing::info!("Reached the final checkpoint, switching to normal mode");

                self.headers_first_mode = false;
                self.header_list.clear();

                let Some(state) = sync_peer else {
                    return Ok(());
                };

                state.client.push_get_blocks(vec![best.hash], ZERO_HASH)
            }
        };

        if let (Err(e), Some(peer)) = (res, self.sync_peer) {
            self.request_failed(peer, e);
        }

        Ok(())
    }

    //------------------------------------------------------------------------------------------------- Inventory

    /// Returns `true` if we already have the announced item.
    async fn have_inventory(&mut self, inv: &InvVect) -> Result<bool, BoxError> {
        if inv.inv_type.is_block() {
            return Ok(self.orphans.has(&inv.hash) || self.have_block(inv.hash).await?);
        }

        if inv.inv_type.is_tx() {
            return Ok(self.txpool_have_tx(inv.hash).await?);
        }

        // We don't request other types.
        Ok(true)
    }

    /// Handles an `inv` message, queuing requests for anything we don't have.
    pub(super) async fn handle_inv(
        &mut self,
        peer: PeerId,
        inv: Vec<InvVect>,
    ) -> Result<(), BoxError> {
        if !self.peers.contains_key(&peer) {
            tracing::debug!("Received inv from unknown peer {peer}");
            return Ok(());
        }

        let last_block = inv.iter().rposition(|iv| iv.inv_type.is_block());
        let is_sync_peer = self.sync_peer == Some(peer);
        let current = self.current().await?;

        if let Some(i) = last_block {
            if !is_sync_peer || current {
                if let Some(state) = self.peers.get_mut(&peer) {
                    state.last_announced_block = Some(inv[i].hash);
                }
            }
        }

        // Until we are current we only listen to the sync peer.
        if !is_sync_peer && !current {
            return Ok(());
        }

        if let Some(i) = last_block.filter(|_| current) {
            if let Some(height) = self.block_height(inv[i].hash).await? {
                if let Some(state) = self.peers.get_mut(&peer) {
                    state.update_last_block_height(height);
                }
            }
        }

        for (i, iv) in inv.iter().enumerate() {
            if !iv.inv_type.is_block() && !iv.inv_type.is_tx() {
                continue;
            }

            // Blocks come from the header list in headers-first mode.
            if self.headers_first_mode {
                continue;
            }

            if !self.have_inventory(iv).await? {
                if iv.inv_type.is_tx() && self.rejected_txns.contains(&iv.hash) {
                    continue;
                }

                if let Some(state) = self.peers.get_mut(&peer) {
                    state.request_queue.push_back(*iv);
                }
                continue;
            }

            if !iv.inv_type.is_block() {
                continue;
            }

            if self.orphans.has(&iv.hash) {
                let root = self.orphans.orphan_root(&iv.hash);
                let locator = self.latest_block_locator().await?;

                let Some(state) = self.peers.get(&peer) else {
                    return Ok(());
                };
                if let Err(e) = state.client.push_get_blocks(locator, root) {
                    self.request_failed(peer, e);
                    return Ok(());
                }
                continue;
            }

            // The peer announced a block we have as its last, it likely has more after it.
            if Some(i) == last_block {
                let locator = self.block_locator_from_hash(iv.hash).await?;

                let Some(state) = self.peers.get(&peer) else {
                    return Ok(());
                };
                if let Err(e) = state.client.push_get_blocks(locator, ZERO_HASH) {
                    self.request_failed(peer, e);
                    return Ok(());
                }
            }
        }

        self.request_queued_inventory(peer);

        Ok(())
    }

    /// Requests queued inventory from the peer, skipping anything already in flight.
    fn request_queued_inventory(&mut self, peer: PeerId) {
        let Some(state) = self.peers.get_mut(&peer) else {
            return;
        };

        let max = self.config.max_inv_per_msg.max(1);
        let mut get_data = Vec::new();

        while let Some(iv) = state.request_queue.pop_front() {
            if iv.inv_type.is_block() {
                if !self.requested_blocks.contains_key(&iv.hash)
                    && self.requested_blocks.len() < self.config.max_requested_blocks
                {
                    self.requested_blocks.insert(iv.hash, peer);
                    state.requested_blocks.insert(iv.hash);
                    get_data.push(InvVect {
                        inv_type: state.block_inv_type(),
                        hash: iv.hash,
                    });
                }
            } else if iv.inv_type.is_tx()
                && !self.requested_txns.contains_key(&iv.hash)
                && self.requested_txns.len() < self.config.max_requested_txns
            {
                self.requested_txns.insert(iv.hash, peer);
                state.requested_txns.insert(iv.hash);
                get_data.push(InvVect {
                    inv_type: state.tx_inv_type(),
                    hash: iv.hash,
                });
            }

            if get_data.len() >= max {
                break;
            }
        }

        if let Err(e) = state.client.queue_get_data(get_data) {
            self.request_failed(peer, e);
        }
    }

    /// Handles a `notfound` message, releasing the items so they can be requested elsewhere.
    pub(super) fn handle_not_found(&mut self, peer: PeerId, inv: &[InvVect]) {
        let Some(state) = self.peers.get_mut(&peer) else {
            tracing::debug!("Received notfound from unknown peer {peer}");
            return;
        };

        for iv in inv {
            if iv.inv_type.is_block() {
                if state.requested_blocks.remove(&iv.hash) {
                    self.requested_blocks.remove(&iv.hash);
                    state.not_found_blocks.insert(iv.hash);
                    self.blocks_released = true;
                }
            } else if iv.inv_type.is_tx() && state.requested_txns.remove(&iv.hash) {
                self.requested_txns.remove(&iv.hash);
            }
        }
    }

    //------------------------------------------------------------------------------------------------- Transactions

    /// Handles a transaction from a peer.
    pub(super) async fn handle_tx(
        &mut self,
        peer: PeerId,
        tx: Arc<Transaction>,
    ) -> Result<(), BoxError> {
        let hash = tx.hash();

        if !self.peers.contains_key(&peer) {
            tracing::debug!("Received tx from unknown peer {peer}");
            return Ok(());
        }

        if self.rejected_txns.contains(&hash) {
            tracing::debug!(
                "Ignoring unsolicited previously rejected transaction {} from {peer}",
                hex::encode(hash)
            );
            return Ok(());
        }

        let res = self.txpool_process_tx(tx).await;

        if let Some(state) = self.peers.get_mut(&peer) {
            state.requested_txns.remove(&hash);
        }
        self.requested_txns.remove(&hash);

        match res {
            Ok(accepted) => {
                if !accepted.is_empty() {
                    self.notifier.announce_new_transactions(&accepted);
                }
            }
            Err(TxPoolError::Duplicate) => {
                tracing::debug!("Already have transaction {}", hex::encode(hash));
            }
            Err(TxPoolError::Policy(reason)) => {
                tracing::debug!(
                    "Rejected transaction {} from {peer}: {reason}",
                    hex::encode(hash)
                );
                self.reject_tx(hash);
            }
            Err(TxPoolError::Rule(reason)) => {
                self.reject_tx(hash);
                self.disconnect_peer(peer, &SyncError::InvalidTransaction(reason));
            }
            Err(TxPoolError::Internal(e)) => {
                tracing::error!("Failed to process transaction {}: {e}", hex::encode(hash));
                self.reject_tx(hash);
            }
        }

        Ok(())
    }

    //------------------------------------------------------------------------------------------------- Stalls

    /// Expires orphans and drops the sync peer if it stalled.
    ///
    /// A sync peer that is not stalled but has nothing we need is swapped for a peer ahead of us.
    pub(super) async fn handle_stall_sample(&mut self) -> Result<(), BoxError> {
        let now = Instant::now();

        let expired = self.orphans.expire(now);
        if !expired.is_empty() {
            tracing::debug!("Expired {} orphan blocks", expired.len());
        }

        let Some(sync_peer) = self.sync_peer else {
            return Ok(());
        };

        let best = self.best_state().await?;

        let Some(state) = self.peers.get(&sync_peer) else {
            return Ok(());
        };

        match self
            .stall_detector
            .sample(state, self.headers_first_mode, best.height, now)
        {
            StallVerdict::Stalled => {
                tracing::info!(
                    "Sync peer {sync_peer} made no progress for {:?}, disconnecting it",
                    now.saturating_duration_since(state.last_block_time)
                );

                self.disconnect_peer(sync_peer, &SyncError::Stalled);
                self.start_sync(None).await
            }
            StallVerdict::Progressing => self.replace_idle_sync_peer().await,
        }
    }

    /// Swaps the sync peer for a candidate ahead of us if the sync peer has no more blocks to give
    /// us and nothing in flight.
    async fn replace_idle_sync_peer(&mut self) -> Result<(), BoxError> {
        let Some(sync_peer) = self.sync_peer else {
            return Ok(());
        };

        let best = self.best_state().await?;

        let Some(state) = self.peers.get(&sync_peer) else {
            return Ok(());
        };

        if state.peer_height() > best.height || !state.requested_blocks.is_empty() {
            return Ok(());
        }

        let (higher, _) = self.sync_candidates(best.height, Some(sync_peer));
        if higher.is_empty() {
            return Ok(());
        }

        tracing::info!(
            "Sync peer {sync_peer} has no blocks past height {}, switching to a peer ahead of us",
            best.height
        );

        self.sync_peer = None;
        self.start_sync(Some(sync_peer)).await
    }

    //------------------------------------------------------------------------------------------------- Commands

    /// Looks for work after something outside the manager asked us to.
    pub(super) async fn handle_rescan(&mut self) -> Result<(), BoxError> {
        if self.sync_peer.is_none() {
            self.start_sync(None).await?;
        }

        self.fetch_header_blocks().await?;

        let queued = self
            .peers
            .iter()
            .filter(|(_, state)| !state.request_queue.is_empty())
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();

        for peer in queued {
            self.request_queued_inventory(peer);
        }

        Ok(())
    }

    pub(super) async fn handle_command(&mut self, command: SyncCommand) -> Result<(), BoxError> {
        match command {
            SyncCommand::SyncPeerId(tx) => {
                let _ = tx.send(self.sync_peer);
            }
            SyncCommand::ProcessBlock {
                block,
                flags,
                response_tx,
            } => {
                let res = match self.process_new_block(block, None, flags).await {
                    Ok(BlockOutcome::Committed) => Ok(false),
                    Ok(BlockOutcome::Orphan) => Ok(true),
                    Ok(BlockOutcome::Duplicate) => Err(ChainError::Duplicate),
                    Ok(BlockOutcome::Invalid(reason)) => Err(ChainError::Rule(reason)),
                    Err(e) => Err(e),
                };

                let committed = matches!(res, Ok(false));
                let _ = response_tx.send(res);

                if committed {
                    self.check_headers_first_progress(None).await?;
                }
            }
            SyncCommand::IsCurrent(tx) => match self.current().await {
                Ok(current) => {
                    let _ = tx.send(current);
                }
                Err(e) => {
                    let _ = tx.send(false);
                    return Err(e.into());
                }
            },
            SyncCommand::Pause {
                paused_tx,
                resume_rx,
            } => {
                if paused_tx.send(()).is_ok() {
                    tracing::debug!("Sync manager paused.");
                    let _ = resume_rx.await;
                    tracing::debug!("Sync manager resumed.");
                }
            }
        }

        Ok(())
    }
}

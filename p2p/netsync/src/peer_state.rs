//! Per-peer sync bookkeeping.
use std::collections::{HashSet, VecDeque};

use tokio::time::Instant;

use ohmc_p2p_core::{PeerClient, PeerId, PeerInformation, ServiceFlags};
use ohmc_types::{InvType, InvVect};

/// Returns `true` if we would download the chain from this peer.
///
/// On the regression test network every peer is a candidate, otherwise the peer must be a full node.
pub(crate) fn is_sync_candidate(info: &PeerInformation, is_regtest: bool) -> bool {
    is_regtest || info.services.contains(ServiceFlags::NETWORK)
}

/// The sync state of a connected peer.
#[derive(Debug)]
pub(crate) struct PeerSyncState {
    /// The peer's client, to send it requests.
    pub client: PeerClient,
    pub sync_candidate: bool,
    /// The blocks we requested from this peer that have not arrived.
    pub requested_blocks: HashSet<[u8; 32]>,
    /// The transactions we requested from this peer that have not arrived.
    pub requested_txns: HashSet<[u8; 32]>,
    /// Blocks this peer told us it does not have.
    pub not_found_blocks: HashSet<[u8; 32]>,
    /// The last time this peer made progress.
    pub last_block_time: Instant,
    /// The height of the best block we know this peer has.
    pub last_block: u64,
    /// The last block this peer announced, if we don't have it yet.
    pub last_announced_block: Option<[u8; 32]>,
    /// Announced inventory waiting to be requested.
    pub request_queue: VecDeque<InvVect>,
}

impl PeerSyncState {
    pub(crate) fn new(client: PeerClient, sync_candidate: bool, now: Instant) -> Self {
        Self {
            last_block: client.info.starting_height,
            client,
            sync_candidate,
            requested_blocks: HashSet::new(),
            requested_txns: HashSet::new(),
            not_found_blocks: HashSet::new(),
            last_block_time: now,
            last_announced_block: None,
            request_queue: VecDeque::new(),
        }
    }

    pub(crate) const fn id(&self) -> PeerId {
        self.client.info.id
    }

    /// The height this peer claims to be at.
    pub(crate) fn peer_height(&self) -> u64 {
        self.last_block.max(self.client.info.starting_height)
    }

    /// Raises the peer's known height, never lowering it.
    pub(crate) fn update_last_block_height(&mut self, height: u64) {
        if height > self.last_block {
            tracing::trace!("Updating height of peer {} to {height}", self.id());
            self.last_block = height;
        }
    }

    /// The inventory type to use when requesting a block from this peer.
    pub(crate) fn block_inv_type(&self) -> InvType {
        if self.client.info.services.contains(ServiceFlags::WITNESS) {
            InvType::WitnessBlock
        } else {
            InvType::Block
        }
    }

    /// The inventory type to use when requesting a transaction from this peer.
    pub(crate) fn tx_inv_type(&self) -> InvType {
        if self.client.info.services.contains(ServiceFlags::WITNESS) {
            InvType::WitnessTx
        } else {
            InvType::Tx
        }
    }
}

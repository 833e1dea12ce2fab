//! Mock peers.
use tokio::sync::mpsc;

use ohmc_p2p_core::{
    handles::{BanPeer, ConnectionGuard, HandleBuilder},
    ConnectionDirection, PeerClient, PeerId, PeerInformation, PeerRequest, ServiceFlags,
};
use ohmc_types::InvType;

/// The default size of a [`MockPeer`]'s request channel.
pub const MOCK_PEER_REQUEST_CAPACITY: usize = 64;

/// A connected peer, holding the connection task's side of the [`PeerClient`].
#[derive(Debug)]
pub struct MockPeer {
    /// The client to hand to the sync manager.
    pub client: PeerClient,
    /// The requests queued on this peer.
    pub requests: mpsc::Receiver<PeerRequest>,
    /// The connection task's guard, dropping it closes the connection.
    pub guard: ConnectionGuard,
}

impl MockPeer {
    /// Creates a full node peer advertising `starting_height`.
    pub fn new(id: u64, starting_height: u64) -> Self {
        Self::with_services(
            id,
            starting_height,
            ServiceFlags::NETWORK | ServiceFlags::WITNESS,
            MOCK_PEER_REQUEST_CAPACITY,
        )
    }

    /// Creates a peer advertising `services` with a request channel of `capacity`.
    pub fn with_services(
        id: u64,
        starting_height: u64,
        services: ServiceFlags,
        capacity: usize,
    ) -> Self {
        let (guard, handle) = HandleBuilder::new().build();

        let (client, requests) = PeerClient::new(
            PeerInformation {
                id: PeerId::Unknown(id),
                handle,
                direction: ConnectionDirection::Outbound,
                services,
                starting_height,
            },
            capacity,
        );

        Self {
            client,
            requests,
            guard,
        }
    }

    /// The peer's ID.
    pub const fn id(&self) -> PeerId {
        self.client.info.id
    }

    /// Returns `true` if the connection was closed.
    pub fn is_closed(&self) -> bool {
        self.client.info.handle.is_closed()
    }

    /// Returns the ban given to this peer, if any.
    pub fn ban(&self) -> Option<BanPeer> {
        self.client.info.handle.check_should_ban()
    }

    /// Takes every request queued on this peer so far.
    pub fn drain_requests(&mut self) -> Vec<PeerRequest> {
        let mut requests = Vec::new();
        while let Ok(req) = self.requests.try_recv() {
            requests.push(req);
        }
        requests
    }
}

/// Returns the hashes of every block requested with `getdata` in `requests`, in order.
pub fn requested_blocks(requests: &[PeerRequest]) -> Vec<[u8; 32]> {
    requested_of_type(requests, InvType::is_block)
}

/// Returns the hashes of every transaction requested with `getdata` in `requests`, in order.
pub fn requested_txs(requests: &[PeerRequest]) -> Vec<[u8; 32]> {
    requested_of_type(requests, InvType::is_tx)
}

fn requested_of_type(requests: &[PeerRequest], f: fn(InvType) -> bool) -> Vec<[u8; 32]> {
    requests
        .iter()
        .filter_map(|req| match req {
            PeerRequest::GetData(invs) => Some(invs),
            _ => None,
        })
        .flatten()
        .filter(|inv| f(inv.inv_type))
        .map(|inv| inv.hash)
        .collect()
}

/// Returns the `(locator, stop_hash)` of every `getheaders` request in `requests`, in order.
pub fn get_headers_requests(requests: &[PeerRequest]) -> Vec<(Vec<[u8; 32]>, [u8; 32])> {
    requests
        .iter()
        .filter_map(|req| match req {
            PeerRequest::GetHeaders { locator, stop_hash } => Some((locator.clone(), *stop_hash)),
            _ => None,
        })
        .collect()
}

/// Returns the `(locator, stop_hash)` of every `getblocks` request in `requests`, in order.
pub fn get_blocks_requests(requests: &[PeerRequest]) -> Vec<(Vec<[u8; 32]>, [u8; 32])> {
    requests
        .iter()
        .filter_map(|req| match req {
            PeerRequest::GetBlocks { locator, stop_hash } => Some((locator.clone(), *stop_hash)),
            _ => None,
        })
        .collect()
}

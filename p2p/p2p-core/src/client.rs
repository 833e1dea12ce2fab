//! The client side of a peer connection.
//!
//! A [`PeerClient`] queues [`PeerRequest`]s on the peer's connection task, which turns them into
//! wire messages. Queuing never waits: if the connection task is not keeping up the request fails
//! with [`PeerRequestError::ChannelFull`] and the caller decides what to do with the peer.
use std::{
    fmt::{Display, Formatter},
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::mpsc::{self, error::TrySendError};

use ohmc_types::InvVect;

use crate::{handles::ConnectionHandle, ConnectionDirection, PeerRequestError, ServiceFlags};

/// An internal identifier for a given peer, will be their address if known
/// or a random u64 if not.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PeerId {
    /// A known address
    KnownAddr(SocketAddr),
    /// An unknown address (probably an inbound anonymity network connection).
    Unknown(u64),
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KnownAddr(addr) => addr.fmt(f),
            Self::Unknown(id) => write!(f, "Unknown addr, ID: {id}"),
        }
    }
}

/// Information on a connected peer.
#[derive(Debug, Clone)]
pub struct PeerInformation {
    /// The internal peer ID of this peer.
    pub id: PeerId,
    /// The [`ConnectionHandle`] for this peer, allows banning this peer and checking if it is still
    /// alive.
    pub handle: ConnectionHandle,
    /// The direction of this connection (inbound|outbound).
    pub direction: ConnectionDirection,
    /// The services the peer advertised.
    pub services: ServiceFlags,
    /// The height the peer advertised in its handshake.
    pub starting_height: u64,
}

/// A request to send to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerRequest {
    /// A `getheaders` request.
    GetHeaders {
        locator: Vec<[u8; 32]>,
        stop_hash: [u8; 32],
    },
    /// A `getblocks` request, the peer will answer with an `inv` of block hashes.
    GetBlocks {
        locator: Vec<[u8; 32]>,
        stop_hash: [u8; 32],
    },
    /// A `getdata` request.
    GetData(Vec<InvVect>),
}

/// The start and stop hash of the last `getblocks`/`getheaders` request, used to filter duplicates.
#[derive(Debug, Default)]
struct LastLocatorRequests {
    get_blocks: Option<([u8; 32], [u8; 32])>,
    get_headers: Option<([u8; 32], [u8; 32])>,
}

/// A handle to queue requests on a peer's connection task.
#[derive(Debug, Clone)]
pub struct PeerClient {
    /// Information on the connected peer.
    pub info: PeerInformation,
    request_tx: mpsc::Sender<PeerRequest>,
    last_requests: Arc<Mutex<LastLocatorRequests>>,
}

impl PeerClient {
    /// Creates a new [`PeerClient`] with a request channel of `capacity`.
    ///
    /// The returned receiver should be given to the peer's connection task.
    pub fn new(info: PeerInformation, capacity: usize) -> (Self, mpsc::Receiver<PeerRequest>) {
        let (request_tx, request_rx) = mpsc::channel(capacity);

        (
            Self {
                info,
                request_tx,
                last_requests: Arc::default(),
            },
            request_rx,
        )
    }

    /// Queues a `getheaders` request.
    ///
    /// A request identical to the previous `getheaders` request is not sent again.
    pub fn push_get_headers(
        &self,
        locator: Vec<[u8; 32]>,
        stop_hash: [u8; 32],
    ) -> Result<(), PeerRequestError> {
        let Some(&begin) = locator.first() else {
            return self.send(PeerRequest::GetHeaders { locator, stop_hash });
        };

        if !self.record_request(|last| &mut last.get_headers, (begin, stop_hash)) {
            tracing::trace!("Filtering duplicate getheaders request to {}", self.info.id);
            return Ok(());
        }

        self.send(PeerRequest::GetHeaders { locator, stop_hash })
            .inspect_err(|_| self.lock_last_requests().get_headers = None)
    }

    /// Queues a `getblocks` request.
    ///
    /// A request identical to the previous `getblocks` request is not sent again.
    pub fn push_get_blocks(
        &self,
        locator: Vec<[u8; 32]>,
        stop_hash: [u8; 32],
    ) -> Result<(), PeerRequestError> {
        let Some(&begin) = locator.first() else {
            return self.send(PeerRequest::GetBlocks { locator, stop_hash });
        };

        if !self.record_request(|last| &mut last.get_blocks, (begin, stop_hash)) {
            tracing::trace!("Filtering duplicate getblocks request to {}", self.info.id);
            return Ok(());
        }

        self.send(PeerRequest::GetBlocks { locator, stop_hash })
            .inspect_err(|_| self.lock_last_requests().get_blocks = None)
    }

    /// Queues a `getdata` request.
    pub fn queue_get_data(&self, inventory: Vec<InvVect>) -> Result<(), PeerRequestError> {
        if inventory.is_empty() {
            return Ok(());
        }

        self.send(PeerRequest::GetData(inventory))
    }

    /// Forgets the last `getblocks` and `getheaders` requests, so the next ones are always sent.
    pub fn forget_last_requests(&self) {
        *self.lock_last_requests() = LastLocatorRequests::default();
    }

    /// Records `request` as the last request in the slot chosen by `slot`, returns `false` if it is
    /// the same as the previous one.
    fn record_request(
        &self,
        slot: impl FnOnce(&mut LastLocatorRequests) -> &mut Option<([u8; 32], [u8; 32])>,
        request: ([u8; 32], [u8; 32]),
    ) -> bool {
        let mut last_requests = self.lock_last_requests();
        let last = slot(&mut last_requests);

        if *last == Some(request) {
            return false;
        }

        *last = Some(request);
        true
    }

    fn lock_last_requests(&self) -> std::sync::MutexGuard<'_, LastLocatorRequests> {
        self.last_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, request: PeerRequest) -> Result<(), PeerRequestError> {
        self.request_tx.try_send(request).map_err(|e| match e {
            TrySendError::Full(_) => PeerRequestError::ChannelFull,
            TrySendError::Closed(_) => PeerRequestError::ChannelClosed,
        })
    }
}

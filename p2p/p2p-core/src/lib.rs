//! # Ohmc P2P Core
//!
//! The peer side of the sync manager's world: an identifier for each connection ([`PeerId`]),
//! the information learnt about a peer during the handshake ([`PeerInformation`]), a
//! [`ConnectionHandle`](handles::ConnectionHandle) to ban/disconnect it and a [`PeerClient`]
//! to queue outbound requests to its connection task. The [`PeerNotifier`](notifier::PeerNotifier)
//! is how new blocks and transactions are announced back to the peer set.
//!
//! Wire framing and the handshake itself are done by the connection task, this crate only carries
//! typed requests to it.

pub mod client;
pub mod error;
pub mod handles;
pub mod notifier;

pub use client::{PeerClient, PeerId, PeerInformation, PeerRequest};
pub use error::PeerRequestError;
pub use notifier::{BroadcastNotifier, PeerNotification, PeerNotifier, RelayData};

/// The direction of a connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionDirection {
    /// An inbound connection to our node.
    Inbound,
    /// An outbound connection from our node.
    Outbound,
}

bitflags::bitflags! {
    /// The services a peer advertised during the handshake.
    #[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct ServiceFlags: u64 {
        /// The peer is a full node and can serve the whole chain.
        const NETWORK = 1 << 0;
        const GET_UTXO = 1 << 1;
        const BLOOM = 1 << 2;
        /// The peer can serve witness data.
        const WITNESS = 1 << 3;
        const XTHIN = 1 << 4;
        const COMPACT_FILTERS = 1 << 6;
        /// The peer only serves the last 288 blocks.
        const NETWORK_LIMITED = 1 << 10;
    }
}

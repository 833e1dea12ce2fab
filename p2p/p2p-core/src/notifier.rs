//! Peer notifications.
//!
//! The sync manager tells the rest of the node about new blocks and transactions through a
//! [`PeerNotifier`]. The node's peer set decides which peers to forward each notification to.
use tokio::sync::broadcast;

use ohmc_types::{txpool::TxDesc, BlockHeader, InvVect, Transaction};

use crate::PeerId;

/// The data being relayed alongside a [`InvVect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayData {
    /// The header of a relayed block.
    BlockHeader(BlockHeader),
    /// A relayed transaction.
    Transaction(TxDesc),
}

/// An interface to notify peers of new data.
pub trait PeerNotifier: Send + Sync + 'static {
    /// Announce newly accepted transactions to peers.
    fn announce_new_transactions(&self, txns: &[TxDesc]);

    /// A block was connected, peers that announced `latest_block` are now at `height`.
    ///
    /// `updated_by` is the peer that supplied the block, its height is already up to date.
    fn update_peer_heights(&self, latest_block: &[u8; 32], height: u64, updated_by: &PeerId);

    /// Relay an inventory item to peers that don't know about it.
    fn relay_inventory(&self, inv: InvVect, data: RelayData);

    /// A transaction was confirmed in a block, it no longer needs rebroadcasting.
    fn transaction_confirmed(&self, tx: &Transaction);
}

/// A notification sent by a [`BroadcastNotifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerNotification {
    /// See [`PeerNotifier::announce_new_transactions`].
    AnnounceNewTransactions(Vec<TxDesc>),
    /// See [`PeerNotifier::update_peer_heights`].
    UpdatePeerHeights {
        latest_block: [u8; 32],
        height: u64,
        updated_by: PeerId,
    },
    /// See [`PeerNotifier::relay_inventory`].
    RelayInventory { inv: InvVect, data: RelayData },
    /// See [`PeerNotifier::transaction_confirmed`], holds the confirmed transaction's hash.
    TransactionConfirmed([u8; 32]),
}

/// A [`PeerNotifier`] that sends [`PeerNotification`]s down a [`broadcast`] channel.
///
/// Notifications are dropped if nothing is subscribed.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<PeerNotification>,
}

impl BroadcastNotifier {
    /// Creates a new [`BroadcastNotifier`] with a channel holding `capacity` notifications.
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<PeerNotification>) {
        let (tx, rx) = broadcast::channel(capacity);
        (Self { tx }, rx)
    }

    /// Returns a new receiver of notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerNotification> {
        self.tx.subscribe()
    }

    fn send(&self, notification: PeerNotification) {
        if self.tx.send(notification).is_err() {
            tracing::trace!("No subscribers for peer notification.");
        }
    }
}

impl PeerNotifier for BroadcastNotifier {
    fn announce_new_transactions(&self, txns: &[TxDesc]) {
        if txns.is_empty() {
            return;
        }

        self.send(PeerNotification::AnnounceNewTransactions(txns.to_vec()));
    }

    fn update_peer_heights(&self, latest_block: &[u8; 32], height: u64, updated_by: &PeerId) {
        self.send(PeerNotification::UpdatePeerHeights {
            latest_block: *latest_block,
            height,
            updated_by: *updated_by,
        });
    }

    fn relay_inventory(&self, inv: InvVect, data: RelayData) {
        self.send(PeerNotification::RelayInventory { inv, data });
    }

    fn transaction_confirmed(&self, tx: &Transaction) {
        self.send(PeerNotification::TransactionConfirmed(tx.hash()));
    }
}

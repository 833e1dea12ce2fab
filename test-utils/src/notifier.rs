//! A [`PeerNotifier`] that records notifications.
use std::sync::{Arc, Mutex, MutexGuard};

use ohmc_p2p_core::{PeerId, PeerNotification, PeerNotifier, RelayData};
use ohmc_types::{txpool::TxDesc, InvVect, Transaction};

/// A [`PeerNotifier`] that records every notification it is given.
///
/// Cloning gives another handle to the same record.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier(Arc<Mutex<Vec<PeerNotification>>>);

impl RecordingNotifier {
    /// Creates a new [`RecordingNotifier`].
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self) -> MutexGuard<'_, Vec<PeerNotification>> {
        self.0.lock().unwrap()
    }

    /// Returns every notification, in order.
    pub fn notifications(&self) -> Vec<PeerNotification> {
        self.record().clone()
    }

    /// Removes all recorded notifications.
    pub fn clear(&self) {
        self.record().clear();
    }

    /// Returns the hashes of every relayed block, in order.
    pub fn relayed_blocks(&self) -> Vec<[u8; 32]> {
        self.record()
            .iter()
            .filter_map(|n| match n {
                PeerNotification::RelayInventory {
                    inv,
                    data: RelayData::BlockHeader(_),
                } => Some(inv.hash),
                _ => None,
            })
            .collect()
    }

    /// Returns the hashes of every confirmed transaction, in order.
    pub fn confirmed_txs(&self) -> Vec<[u8; 32]> {
        self.record()
            .iter()
            .filter_map(|n| match n {
                PeerNotification::TransactionConfirmed(hash) => Some(*hash),
                _ => None,
            })
            .collect()
    }

    /// Returns the hashes of every announced transaction, in order.
    pub fn announced_txs(&self) -> Vec<[u8; 32]> {
        self.record()
            .iter()
            .filter_map(|n| match n {
                PeerNotification::AnnounceNewTransactions(txs) => {
                    Some(txs.iter().map(|tx| tx.hash))
                }
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Returns every `(block, height, peer)` peer height update, in order.
    pub fn height_updates(&self) -> Vec<([u8; 32], u64, PeerId)> {
        self.record()
            .iter()
            .filter_map(|n| match n {
                PeerNotification::UpdatePeerHeights {
                    latest_block,
                    height,
                    updated_by,
                } => Some((*latest_block, *height, *updated_by)),
                _ => None,
            })
            .collect()
    }
}

impl PeerNotifier for RecordingNotifier {
    fn announce_new_transactions(&self, txns: &[TxDesc]) {
        self.record()
            .push(PeerNotification::AnnounceNewTransactions(txns.to_vec()));
    }

    fn update_peer_heights(&self, latest_block: &[u8; 32], height: u64, updated_by: &PeerId) {
        self.record().push(PeerNotification::UpdatePeerHeights {
            latest_block: *latest_block,
            height,
            updated_by: *updated_by,
        });
    }

    fn relay_inventory(&self, inv: InvVect, data: RelayData) {
        self.record()
            .push(PeerNotification::RelayInventory { inv, data });
    }

    fn transaction_confirmed(&self, tx: &Transaction) {
        self.record()
            .push(PeerNotification::TransactionConfirmed(tx.hash()));
    }
}

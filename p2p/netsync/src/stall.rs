//! Sync peer stall detection.
use std::time::Duration;

use tokio::time::Instant;

use crate::peer_state::PeerSyncState;

/// The result of sampling the sync peer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum StallVerdict {
    /// The peer is making progress, or we are not waiting on it.
    Progressing,
    /// The peer has not made progress for too long and should be dropped.
    Stalled,
}

#[derive(Debug, Copy, Clone)]
pub(crate) struct StallDetector {
    timeout: Duration,
}

impl StallDetector {
    pub(crate) const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Checks the sync peer for a stall.
    ///
    /// A peer is only stalled if we are waiting on it: it has blocks in flight, we are downloading
    /// headers from it, or it claims to be ahead of us.
    pub(crate) fn sample(
        &self,
        sync_peer: &PeerSyncState,
        headers_first: bool,
        our_height: u64,
        now: Instant,
    ) -> StallVerdict {
        if now.saturating_duration_since(sync_peer.last_block_time) <= self.timeout {
            return StallVerdict::Progressing;
        }

        let waiting = !sync_peer.requested_blocks.is_empty()
            || headers_first
            || sync_peer.peer_height() > our_height;

        if !waiting {
            return StallVerdict::Progressing;
        }

        StallVerdict::Stalled
    }
}

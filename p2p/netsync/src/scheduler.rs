//! # Request Scheduler
//!
//! The pieces of sync that decide what to request and from whom:
//!
//! - [`HeaderList`], the headers downloaded during headers-first sync that we don't have blocks for yet.
//! - [`assign_block_requests`], which spreads the blocks in the download window over peers.
//! - [`pick_sync_peer`], which picks the peer to sync from.
use std::collections::{HashMap, VecDeque};

use rand::{seq::SliceRandom, Rng};

use ohmc_p2p_core::PeerId;
use ohmc_types::BlockHeader;

use crate::SyncError;

/// A header in the [`HeaderList`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct HeaderNode {
    pub height: u64,
    pub hash: [u8; 32],
}

/// A contiguous list of headers, starting at a block we have.
///
/// Every node is one above the node before it and links to it.
#[derive(Debug, Default)]
pub(crate) struct HeaderList {
    nodes: VecDeque<HeaderNode>,
    /// A map of block hash to height, for every node in the list.
    index: HashMap<[u8; 32], u64>,
}

impl HeaderList {
    /// Clears the list and starts it again from `base`.
    pub(crate) fn reset(&mut self, base: HeaderNode) {
        self.clear();
        self.push(base);
    }

    pub(crate) fn clear(&mut self) {
        self.nodes.clear();
        self.index.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn last(&self) -> Option<&HeaderNode> {
        self.nodes.back()
    }

    pub(crate) fn contains(&self, hash: &[u8; 32]) -> bool {
        self.index.contains_key(hash)
    }

    /// Returns the node at `height`.
    pub(crate) fn get(&self, height: u64) -> Option<&HeaderNode> {
        let first = self.nodes.front()?;
        let idx = usize::try_from(height.checked_sub(first.height)?).ok()?;
        self.nodes.get(idx)
    }

    /// Checks that `headers` link to the end of the list and to each other, returning the nodes to
    /// add for them.
    ///
    /// The list is not changed.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnconnectedHeaders`] if the headers do not link.
    pub(crate) fn connect(&self, headers: &[BlockHeader]) -> Result<Vec<HeaderNode>, SyncError> {
        let mut prev = *self.last().ok_or(SyncError::UnconnectedHeaders)?;
        let mut nodes = Vec::with_capacity(headers.len());

        for header in headers {
            if header.previous != prev.hash {
                tracing::debug!(
                    "Header {} does not connect to the previous header {}",
                    hex::encode(header.hash()),
                    hex::encode(prev.hash)
                );
                return Err(SyncError::UnconnectedHeaders);
            }

            prev = HeaderNode {
                height: prev.height + 1,
                hash: header.hash(),
            };
            nodes.push(prev);
        }

        Ok(nodes)
    }

    /// Adds nodes returned from [`HeaderList::connect`].
    pub(crate) fn extend(&mut self, nodes: impl IntoIterator<Item = HeaderNode>) {
        for node in nodes {
            self.push(node);
        }
    }

    /// Removes every node below `height`.
    pub(crate) fn prune_below(&mut self, height: u64) {
        while let Some(front) = self.nodes.front() {
            if front.height >= height {
                break;
            }
            self.index.remove(&front.hash);
            self.nodes.pop_front();
        }
    }

    fn push(&mut self, node: HeaderNode) {
        self.index.insert(node.hash, node.height);
        self.nodes.push_back(node);
    }
}

/// A peer's capacity for block requests.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct PeerSlot {
    pub id: PeerId,
    /// The height of the best block we know the peer has.
    pub known_height: u64,
    /// The amount of blocks we can still request from this peer.
    pub free: usize,
}

/// Spreads `wanted` blocks over `slots`.
///
/// Blocks are handed out lowest first, each to the first slot with room that has a high enough
/// `known_height`, and that `unavailable` does not rule out. Every block is given to at most one peer.
///
/// The returned list is in slot order and only holds peers that were given blocks.
pub(crate) fn assign_block_requests(
    wanted: &[HeaderNode],
    slots: &mut [PeerSlot],
    unavailable: impl Fn(&PeerId, &[u8; 32]) -> bool,
) -> Vec<(PeerId, Vec<[u8; 32]>)> {
    let mut assigned: Vec<Vec<[u8; 32]>> = vec![Vec::new(); slots.len()];

    for node in wanted {
        if slots.iter().all(|slot| slot.free == 0) {
            break;
        }

        let Some(i) = slots.iter().position(|slot| {
            slot.free > 0 && slot.known_height >= node.height && !unavailable(&slot.id, &node.hash)
        }) else {
            continue;
        };

        slots[i].free -= 1;
        assigned[i].push(node.hash);
    }

    slots
        .iter()
        .zip(assigned)
        .filter(|(_, hashes)| !hashes.is_empty())
        .map(|(slot, hashes)| (slot.id, hashes))
        .collect()
}

/// Picks the peer to sync from.
///
/// `higher` holds peers ahead of us with the height they claim, `equal` peers at our height. The
/// highest peer is picked, ties are broken randomly. If no peer is ahead a random peer at our
/// height is picked.
pub(crate) fn pick_sync_peer<R: Rng>(
    higher: &[(PeerId, u64)],
    equal: &[PeerId],
    rng: &mut R,
) -> Option<PeerId> {
    if let Some(best_height) = higher.iter().map(|(_, height)| *height).max() {
        let best = higher
            .iter()
            .filter(|(_, height)| *height == best_height)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();

        return best.choose(rng).copied();
    }

    equal.choose(rng).copied()
}

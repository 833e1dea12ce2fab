//! Checkpoints & chain parameters.
use crate::Network;

/// A known good block on the main chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct Checkpoint {
    /// The height of the block.
    pub height: u64,
    /// The hash of the block.
    #[cfg_attr(feature = "serde", serde(with = "hex::serde"))]
    pub hash: [u8; 32],
}

/// The parameters of the chain being synced.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChainParams {
    /// The network.
    pub network: Network,
    /// The checkpoints, sorted by ascending height.
    checkpoints: Vec<Checkpoint>,
}

impl ChainParams {
    /// Creates new [`ChainParams`].
    ///
    /// `checkpoints` will be sorted by height, duplicate heights keep the first entry.
    pub fn new(network: Network, mut checkpoints: Vec<Checkpoint>) -> Self {
        checkpoints.sort_by_key(|c| c.height);
        checkpoints.dedup_by_key(|c| c.height);

        Self {
            network,
            checkpoints,
        }
    }

    /// Returns the checkpoints, sorted by ascending height.
    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    /// Returns the first checkpoint with a height above `height`, if there is one.
    pub fn next_checkpoint(&self, height: u64) -> Option<&Checkpoint> {
        let idx = self.checkpoints.partition_point(|c| c.height <= height);
        self.checkpoints.get(idx)
    }

    /// Returns the checkpoint at exactly `height`, if there is one.
    pub fn checkpoint_at(&self, height: u64) -> Option<&Checkpoint> {
        self.checkpoints
            .binary_search_by_key(&height, |c| c.height)
            .ok()
            .map(|idx| &self.checkpoints[idx])
    }

    /// Returns `true` if this is the regression test network.
    pub const fn is_regtest(&self) -> bool {
        matches!(self.network, Network::Regtest)
    }
}

//! Sync manager config.
use std::{fs::read_to_string, io, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use ohmc_types::{ChainParams, Checkpoint, Network};

use crate::constants::{
    DEFAULT_MAX_BLOCKS_IN_FLIGHT_PER_PEER, DEFAULT_MAX_INV_PER_MSG, DEFAULT_MAX_ORPHAN_BLOCKS,
    DEFAULT_MAX_PEERS, DEFAULT_MAX_REJECTED_TXNS, DEFAULT_MAX_REQUESTED_BLOCKS,
    DEFAULT_MAX_REQUESTED_TXNS,
    DEFAULT_MIN_IN_FLIGHT_BLOCKS, DEFAULT_ORPHAN_EXPIRY, DEFAULT_PROGRESS_LOG_INTERVAL,
    DEFAULT_STALL_TICK_INTERVAL, DEFAULT_STALL_TIMEOUT,
};

/// An error reading a [`SyncManagerConfig`] from a file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to parse config file: {0}")]
    Toml(#[from] toml::de::Error),
}

/// The sync manager config.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct SyncManagerConfig {
    /// The network we are syncing.
    ///
    /// Valid values | "Mainnet", "Testnet", "Regtest", "Simnet"
    pub network: Network,

    /// Known good blocks, headers are downloaded first up to each checkpoint.
    pub checkpoints: Vec<Checkpoint>,

    /// Ignore [`Self::checkpoints`], never use headers-first sync.
    pub disable_checkpoints: bool,

    /// The maximum amount of connected peers, the event channel holds 3 events per peer.
    pub max_peers: usize,

    /// The maximum amount of orphan blocks held at once.
    ///
    /// During headers-first sync blocks are never requested further than this above our tip.
    pub max_orphan_blocks: usize,

    /// How long an orphan block is held before being dropped.
    pub orphan_expiry: Duration,

    /// The time between checks for a stalled sync peer, at least 100ms.
    pub stall_tick_interval: Duration,

    /// The amount of time without progress before the sync peer is considered stalled.
    pub stall_timeout: Duration,

    /// The maximum amount of blocks requested from one peer at once during headers-first sync.
    pub max_blocks_in_flight_per_peer: usize,

    /// When a peer has fewer blocks than this in flight we request more.
    pub min_in_flight_blocks: usize,

    /// The maximum amount of items in a single `getdata` request.
    pub max_inv_per_msg: usize,

    /// The maximum amount of blocks requested across all peers at once.
    pub max_requested_blocks: usize,

    /// The maximum amount of transactions requested across all peers at once.
    pub max_requested_txns: usize,

    /// The maximum amount of rejected transaction hashes to remember.
    pub max_rejected_txns: usize,

    /// Process blocks we did not request instead of disconnecting the peer.
    ///
    /// Regression tests send duplicate blocks on purpose.
    pub accept_unrequested_blocks: bool,

    /// The minimum time between block progress log lines.
    pub progress_log_interval: Duration,
}

impl Default for SyncManagerConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            checkpoints: vec![],
            disable_checkpoints: false,
            max_peers: DEFAULT_MAX_PEERS,
            max_orphan_blocks: DEFAULT_MAX_ORPHAN_BLOCKS,
            orphan_expiry: DEFAULT_ORPHAN_EXPIRY,
            stall_tick_interval: DEFAULT_STALL_TICK_INTERVAL,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            max_blocks_in_flight_per_peer: DEFAULT_MAX_BLOCKS_IN_FLIGHT_PER_PEER,
            min_in_flight_blocks: DEFAULT_MIN_IN_FLIGHT_BLOCKS,
            max_inv_per_msg: DEFAULT_MAX_INV_PER_MSG,
            max_requested_blocks: DEFAULT_MAX_REQUESTED_BLOCKS,
            max_requested_txns: DEFAULT_MAX_REQUESTED_TXNS,
            max_rejected_txns: DEFAULT_MAX_REJECTED_TXNS,
            accept_unrequested_blocks: false,
            progress_log_interval: DEFAULT_PROGRESS_LOG_INTERVAL,
        }
    }
}

impl SyncManagerConfig {
    /// Attempts to read a config file in [`toml`] format from the given [`Path`].
    ///
    /// # Errors
    ///
    /// Will return an [`Err`] if the file cannot be read or if the file is not a valid [`toml`] config.
    pub fn read_from_path(file: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file_text = read_to_string(file.as_ref())?;

        Ok(toml::from_str(&file_text)
            .inspect(|_| {
                tracing::debug!("Using config at: {}", file.as_ref().to_string_lossy());
            })
            .inspect_err(|e| {
                tracing::warn!(
                    "Failed to parse config file at: {}, {e}",
                    file.as_ref().to_string_lossy()
                );
            })?)
    }

    /// Returns the [`ChainParams`] for this config.
    ///
    /// If checkpoints are disabled the returned params have none.
    pub fn chain_params(&self) -> ChainParams {
        let checkpoints = if self.disable_checkpoints {
            vec![]
        } else {
            self.checkpoints.clone()
        };

        ChainParams::new(self.network, checkpoints)
    }

    /// The size of the event channel.
    pub(crate) fn event_channel_size(&self) -> usize {
        self.max_peers.saturating_mul(3).max(1)
    }
}

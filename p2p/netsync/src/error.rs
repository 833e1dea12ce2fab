//! Sync manager errors.
use std::time::Duration;

use ohmc_types::chain::ChainError;

use crate::constants::{LONG_BAN, MEDIUM_BAN, SHORT_BAN};

/// What to do with a peer that caused a [`SyncError`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Misbehaviour {
    /// Close the connection.
    Disconnect,
    /// Close the connection and ban the peer for this long.
    Ban(Duration),
}

/// An error caused by a peer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("The peer sent headers we did not request.")]
    UnrequestedHeaders,
    #[error("The peer sent headers that do not connect to our header chain.")]
    UnconnectedHeaders,
    #[error(
        "The header at height {height} does not match the checkpoint, expected: {}, got: {}.",
        hex::encode(expected),
        hex::encode(got)
    )]
    CheckpointMismatch {
        height: u64,
        expected: [u8; 32],
        got: [u8; 32],
    },
    #[error("The peer sent a block we did not request.")]
    UnrequestedBlock,
    #[error("The peer sent {0} headers in one message.")]
    TooManyHeaders(usize),
    #[error("The peer sent an invalid block: {0}")]
    InvalidBlock(String),
    #[error("The peer sent an invalid transaction: {0}")]
    InvalidTransaction(String),
    #[error("The peer stopped making progress.")]
    Stalled,
    #[error("The peer's request channel is full.")]
    PeerRequestChannelFull,
}

impl SyncError {
    /// Returns what should be done with the peer that caused this error.
    pub const fn misbehaviour(&self) -> Misbehaviour {
        match self {
            Self::UnrequestedHeaders
            | Self::UnrequestedBlock
            | Self::TooManyHeaders(_)
            | Self::Stalled
            | Self::PeerRequestChannelFull => Misbehaviour::Disconnect,
            Self::UnconnectedHeaders => Misbehaviour::Ban(SHORT_BAN),
            Self::CheckpointMismatch { .. } => Misbehaviour::Ban(MEDIUM_BAN),
            Self::InvalidBlock(_) | Self::InvalidTransaction(_) => Misbehaviour::Ban(LONG_BAN),
        }
    }
}

/// An error returned by a [`SyncManagerHandle`](crate::SyncManagerHandle).
#[derive(Debug, thiserror::Error)]
pub enum SyncManagerError {
    /// The sync manager task has exited.
    #[error("The sync manager has stopped.")]
    ManagerStopped,
    /// The chain service returned an error.
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),
}

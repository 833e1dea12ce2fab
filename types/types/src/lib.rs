//! Ohmc shared data types.
//!
//! This crate contains the blockchain data types passed between the sync manager, the peer
//! connections and the chain/mempool services:
//!
//! - [`Block`], [`BlockHeader`] and [`Transaction`]
//! - [`InvVect`] inventory vectors
//! - [`Checkpoint`]s and [`ChainParams`]
//! - the [`Network`] enum
//! - the requests/responses of the [chain](chain) and [transaction pool](txpool) services
//!
//! Hashes are plain `[u8; 32]` arrays, see [`ZERO_HASH`].

mod block;
pub mod chain;
mod inventory;
mod network;
mod params;
mod transaction;
pub mod txpool;

pub use block::{Block, BlockHeader, BLOCK_HEADER_LEN};
pub use inventory::{InvType, InvVect};
pub use network::{Network, ParseNetworkError};
pub use params::{ChainParams, Checkpoint};
pub use transaction::{OutPoint, Transaction, TxIn, TxOut};

/// A boxed, thread safe error.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The all-zero hash.
///
/// Used as the stop hash in `getblocks`/`getheaders` requests to mean "as many as you can give".
pub const ZERO_HASH: [u8; 32] = [0; 32];

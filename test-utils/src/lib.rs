//! Ohmc testing utilities.
//!
//! In-memory stand-ins for the services the sync manager talks to:
//!
//! - [`MockChain`](chain::MockChain), a chain service holding a tree of blocks
//! - [`MockTxPool`](txpool::MockTxPool), a transaction pool service
//! - [`RecordingNotifier`](notifier::RecordingNotifier), a peer notifier that records every notification
//! - [`MockPeer`](peer::MockPeer), a connected peer with its request channel
//!
//! and generators for linked test blocks in [`data`].

pub mod chain;
pub mod data;
pub mod notifier;
pub mod peer;
pub mod txpool;

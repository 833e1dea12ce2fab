//! # Checkpoint Gate
//!
//! Tracks the next checkpoint above our chain, decides whether headers-first sync applies and
//! checks downloaded headers against the checkpoint.
use ohmc_types::{ChainParams, Checkpoint};

use crate::SyncError;

#[derive(Debug)]
pub(crate) struct CheckpointGate {
    params: ChainParams,
    next: Option<Checkpoint>,
}

impl CheckpointGate {
    /// Creates a new gate, the next checkpoint is the first one above `height`.
    pub(crate) fn new(params: ChainParams, height: u64) -> Self {
        let next = params.next_checkpoint(height).copied();
        Self { params, next }
    }

    pub(crate) const fn params(&self) -> &ChainParams {
        &self.params
    }

    /// The next checkpoint, [`None`] if we are past the last one or checkpoints are disabled.
    pub(crate) const fn next(&self) -> Option<&Checkpoint> {
        self.next.as_ref()
    }

    /// Sets the next checkpoint to the first one above `height`, returning it.
    pub(crate) fn reset(&mut self, height: u64) -> Option<&Checkpoint> {
        self.next = self.params.next_checkpoint(height).copied();
        self.next.as_ref()
    }

    /// Returns `true` if the headers up to the next checkpoint should be downloaded before blocks.
    pub(crate) fn headers_first(&self, best_height: u64) -> bool {
        !self.params.is_regtest() && self.next.is_some_and(|cp| best_height < cp.height)
    }

    /// Checks a header against the next checkpoint.
    ///
    /// Returns `Ok(true)` if the header is the checkpoint, `Ok(false)` if it is not at the
    /// checkpoint's height.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::CheckpointMismatch`] if the header is at the checkpoint's height but has
    /// a different hash.
    pub(crate) fn check_header(&self, height: u64, hash: [u8; 32]) -> Result<bool, SyncError> {
        let Some(cp) = self.next else {
            return Ok(false);
        };

        if cp.height != height {
            return Ok(false);
        }

        if cp.hash != hash {
            return Err(SyncError::CheckpointMismatch {
                height,
                expected: cp.hash,
                got: hash,
            });
        }

        Ok(true)
    }
}

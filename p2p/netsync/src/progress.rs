//! Block processing progress logs.
use std::time::Duration;

use tokio::time::Instant;

use ohmc_types::Block;

/// Logs how many blocks and transactions were processed, at most once per interval.
#[derive(Debug)]
pub(crate) struct BlockProgressLogger {
    received_blocks: u64,
    received_txs: u64,
    last_log: Instant,
    interval: Duration,
}

impl BlockProgressLogger {
    pub(crate) fn new(interval: Duration, now: Instant) -> Self {
        Self {
            received_blocks: 0,
            received_txs: 0,
            last_log: now,
            interval,
        }
    }

    /// Counts a processed block, logging progress if the interval has passed.
    ///
    /// Returns `true` if a progress line was logged.
    pub(crate) fn log_block_height(&mut self, block: &Block, height: u64, now: Instant) -> bool {
        self.received_blocks += 1;
        self.received_txs += block.transactions.len() as u64;

        let elapsed = now.saturating_duration_since(self.last_log);
        if elapsed < self.interval {
            return false;
        }

        let block_str = if self.received_blocks == 1 {
            "block"
        } else {
            "blocks"
        };
        let tx_str = if self.received_txs == 1 {
            "transaction"
        } else {
            "transactions"
        };

        tracing::info!(
            "Processed {} {block_str} in the last {:.2}s ({} {tx_str}, height {height}, timestamp {})",
            self.received_blocks,
            elapsed.as_secs_f64(),
            self.received_txs,
            block.header.timestamp,
        );

        self.received_blocks = 0;
        self.received_txs = 0;
        self.last_log = now;

        true
    }

    /// Restarts the interval without logging.
    pub(crate) fn set_last_log_time(&mut self, now: Instant) {
        self.last_log = now;
    }
}

use std::time::Duration;

/// The durations of a short ban.
pub const SHORT_BAN: Duration = Duration::from_secs(60 * 10);

/// The durations of a medium ban.
pub const MEDIUM_BAN: Duration = Duration::from_secs(60 * 60 * 24);

/// The durations of a long ban.
pub const LONG_BAN: Duration = Duration::from_secs(60 * 60 * 24 * 7);

/// The maximum amount of headers a peer may send in one `headers` message.
pub const MAX_HEADERS_PER_MSG: usize = 2_000;

/// The shortest time between checks for a stalled sync peer.
pub(crate) const MIN_STALL_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// The default maximum amount of peers, used to size the event channel.
pub(crate) const DEFAULT_MAX_PEERS: usize = 125;

/// The default maximum amount of orphan blocks held at once.
pub(crate) const DEFAULT_MAX_ORPHAN_BLOCKS: usize = 100;

/// The default amount of time an orphan block is held for.
pub(crate) const DEFAULT_ORPHAN_EXPIRY: Duration = Duration::from_secs(60 * 60);

/// The default time between checks for a stalled sync peer.
pub(crate) const DEFAULT_STALL_TICK_INTERVAL: Duration = Duration::from_secs(30);

/// The default amount of time without progress before the sync peer is considered stalled.
pub(crate) const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// The default maximum amount of blocks requested from a single peer at once during headers-first sync.
pub(crate) const DEFAULT_MAX_BLOCKS_IN_FLIGHT_PER_PEER: usize = 16;

/// The default amount of in-flight blocks a peer must drop below before we request more from it.
pub(crate) const DEFAULT_MIN_IN_FLIGHT_BLOCKS: usize = 10;

/// The default maximum amount of items in one `getdata` request.
pub(crate) const DEFAULT_MAX_INV_PER_MSG: usize = 50_000;

/// The default maximum amount of blocks we track as requested across all peers.
pub(crate) const DEFAULT_MAX_REQUESTED_BLOCKS: usize = 50_000;

/// The default maximum amount of transactions we track as requested across all peers.
pub(crate) const DEFAULT_MAX_REQUESTED_TXNS: usize = 50_000;

/// The default maximum amount of rejected transaction hashes we remember.
pub(crate) const DEFAULT_MAX_REJECTED_TXNS: usize = 1_000;

/// The default minimum time between block progress log lines.
pub(crate) const DEFAULT_PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(10);

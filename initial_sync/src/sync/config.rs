//! Initial sync configuration: protocol constants and runtime tunables.
use chain::MAINNET_CONFIG;
use std::time::Duration;

/// Default number of blocks asked from a peer in a single range request.
pub const DEFAULT_BLOCK_BATCH_LIMIT: u64 = 64;

/// Multiple of the batch size a peer tolerates in a burst.
pub const DEFAULT_BLOCK_BATCH_LIMIT_BURST_FACTOR: u64 = 10;

/// Upper bound on fetch tasks in flight at any time.
pub const MAX_PENDING_REQUESTS: usize = 64;

/// Share of suitable peers considered for a single request.
pub const PEERS_PERCENTAGE_PER_REQUEST: f64 = 0.75;

/// Weight of remaining rate-limiter capacity in the peer ordering score.
pub const PEER_FILTER_CAPACITY_WEIGHT: f64 = 0.2;

/// Epochs scanned one by one before switching to sampling.
pub const NON_SKIPPED_SLOTS_FULL_SEARCH_EPOCHS: u64 = 10;

/// Maximum number of parent lookups while searching for a fork's ancestor.
pub const BACKTRACKING_MAX_HOPS: usize = 128;

pub const MAX_PEERS_TO_SYNC: usize = 15;

pub const MINIMUM_SYNC_PEERS: usize = 3;

/// Penalties after which a peer is no longer asked for blocks.
pub const MAX_BAD_RESPONSES: usize = 5;

/// Number of range state machines kept ahead of the head.
pub const LOOKAHEAD_STEPS: usize = 8;

/// Stale window resets within one epoch before fork search kicks in.
pub const MAX_RESET_ATTEMPTS: usize = 4;

/// Consecutive "no required peers" errors tolerated before the queue gives up.
pub const NO_REQUIRED_PEERS_ERR_MAX_RETRIES: usize = 1000;

pub const POLLING_INTERVAL: Duration = Duration::from_millis(200);

pub const QUEUE_STOP_CALL_TIMEOUT: Duration = Duration::from_secs(1);

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the service re-checks peers while waiting for enough of them.
pub const HANDSHAKE_POLLING_INTERVAL: Duration = Duration::from_secs(5);

/// Which ceiling the sync target is computed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Sync up to the best finalized epoch peers agree on.
    #[default]
    StopOnFinalizedEpoch,
    /// Sync up to the best head any peer reports.
    NonConstrained,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub mode: SyncMode,
    pub batch_size: u64,
    /// Blocks a single peer may have outstanding before requests are delayed.
    pub rate_limiter_capacity: u64,
    /// Blocks per second drained from a peer's bucket.
    pub rate_limiter_refill_rate: u64,
    pub stale_timeout: Duration,
    pub request_timeout: Duration,
    pub polling_interval: Duration,
    pub lookahead_steps: usize,
    pub minimum_sync_peers: usize,
    pub max_peers_to_sync: usize,
}

impl SyncConfig {
    pub fn new() -> Self {
        let batch_size = DEFAULT_BLOCK_BATCH_LIMIT;
        Self {
            mode: SyncMode::default(),
            batch_size,
            rate_limiter_capacity: burst_capacity(batch_size),
            rate_limiter_refill_rate: batch_size,
            stale_timeout: MAINNET_CONFIG.epoch_duration(),
            request_timeout: REQUEST_TIMEOUT,
            polling_interval: POLLING_INTERVAL,
            lookahead_steps: LOOKAHEAD_STEPS,
            minimum_sync_peers: MINIMUM_SYNC_PEERS,
            max_peers_to_sync: MAX_PEERS_TO_SYNC,
        }
    }

    pub fn with_mode(mut self, mode: SyncMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the batch size and rescales the rate limiter to match.
    pub fn with_batch_size(mut self, batch_size: u64) -> Self {
        let batch_size = batch_size.max(1);
        self.batch_size = batch_size;
        self.rate_limiter_capacity = burst_capacity(batch_size);
        self.rate_limiter_refill_rate = batch_size;
        self
    }

    pub fn with_rate_limiter(mut self, capacity: u64, refill_rate: u64) -> Self {
        self.rate_limiter_capacity = capacity;
        self.rate_limiter_refill_rate = refill_rate.max(1);
        self
    }

    pub fn with_stale_timeout(mut self, timeout: Duration) -> Self {
        self.stale_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    pub fn with_lookahead_steps(mut self, steps: usize) -> Self {
        self.lookahead_steps = steps.max(1);
        self
    }

    pub fn with_minimum_sync_peers(mut self, peers: usize) -> Self {
        self.minimum_sync_peers = peers;
        self
    }

    /// Minimum number of peers a single request may be spread over.
    pub fn required_peers(&self) -> usize {
        self.minimum_sync_peers.min(self.max_peers_to_sync)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn burst_capacity(batch_size: u64) -> u64 {
    batch_size * DEFAULT_BLOCK_BATCH_LIMIT_BURST_FACTOR - batch_size
}

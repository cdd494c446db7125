/// Initial sync for the beacon chain.
///
/// This module downloads long ranges of historical blocks from peers and
/// hands them to the chain in slot order. It includes:
///
/// - **Rate Limiter**: Per-peer token buckets bounding outstanding blocks
/// - **Peer Manager**: Tracks peer chain status and bad responses
/// - **Blocks Fetcher**: Selects peers, requests ranges and validates responses
/// - **Blocks Queue**: Sliding window of range state machines ahead of the head
/// - **Initial Sync**: Runs the queue to the finalized epoch, then to the head
///
/// ## Architecture
///
/// 1. The queue keeps `lookahead_steps` ranges of `batch_size` slots above the head
/// 2. Each tick schedules new ranges on the fetcher
/// 3. Fetch results come back over a channel and are attached to their range
/// 4. Ranges are released only after every lower range was delivered
/// 5. Stuck windows are reset, by slot or from an alternative branch
///
/// ## State Machine
///
/// - **new** -> **scheduled** -> **dataParsed** -> **sent**
/// - Failures and empty ranges move to **skipped** and are retried from **new**
pub mod config;
pub mod error;
pub mod fetcher;
pub mod fetcher_utils;
pub mod peer_manager;
pub mod queue;
pub mod rate_limiter;
pub mod service;
pub mod state_machine;
pub mod states;

pub use config::*;
pub use error::SyncError;
pub use fetcher::{BlocksFetcher, FetchRequestParams, FetchRequestResponse};
pub use fetcher_utils::ForkData;
pub use peer_manager::{PeerManager, SyncPeer};
pub use queue::{BlocksQueue, BlocksQueueConfig, FetchedData};
pub use rate_limiter::{RateLimiter, TokenBucket};
pub use service::{InitialSync, SyncStats};
pub use state_machine::{QueueEvent, StateId, StateMachine, StateMachineManager};
pub use states::SyncState;

#[cfg(test)]
mod tests;

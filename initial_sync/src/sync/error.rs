use containers::{Bytes32, Slot};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("slot is higher than the sync target supported by peers")]
    SlotIsTooHigh,
    #[error("invalid data returned from peer")]
    InvalidFetchedData,
    #[error("no peers available, waiting for reconnect")]
    NoPeersAvailable,
    #[error("no peers with alternative blocks found")]
    NoPeersWithAltBlocks,
    #[error("no common ancestor found within backtracking limit")]
    NoCommonAncestor,
    #[error("slot {0} is too low to backtrack")]
    SlotTooLowToBacktrack(Slot),
    #[error("slot {0} is not above the finalized epoch, no backtracking needed")]
    NoBacktrackingNeeded(Slot),
    #[error("no peers with required blocks are found")]
    NoRequiredPeers,
    #[error("queue takes too long to stop")]
    QueueTakesTooLongToStop,
    #[error("queue context is no longer valid")]
    QueueCtxIsDone,
    #[error("fetcher context is done, reinitialize")]
    FetcherCtxIsDone,
    #[error("invalid initial state")]
    InvalidInitialState,
    #[error("request timed out")]
    RequestTimeout,
    #[error("request failed: {0}")]
    Network(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("block at slot {0} is already processed")]
    BlockAlreadyProcessed(Slot),
    #[error("beacon node doesn't have a parent in db with root: {0}")]
    ParentDoesNotExist(Bytes32),
    #[error("block rejected by chain: {0}")]
    BlockRejected(String),
}

impl SyncError {
    /// Errors caused by the engine shutting down rather than by peers.
    pub fn is_shutdown(&self) -> bool {
        matches!(
            self,
            SyncError::Cancelled | SyncError::FetcherCtxIsDone | SyncError::QueueCtxIsDone
        )
    }
}

/// Initial sync state machine.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Idle state: sync not yet started.
    ///
    /// The service stays idle until `run` is called and enough suitable
    /// peers have reported their chain status.
    Idle,

    /// Syncing state: downloading ranges to catch up with the network.
    ///
    /// Covers both the finalized phase and the head phase of a run.
    Syncing,

    /// Synced state: the local head reached the sync target.
    ///
    /// New blocks are expected to arrive through other channels from here on.
    Synced,
}

impl SyncState {
    /// Check if a transition to the target state is valid.
    pub fn can_transition_to(&self, target: SyncState) -> bool {
        match self {
            SyncState::Idle => matches!(target, SyncState::Syncing | SyncState::Synced),
            SyncState::Syncing => matches!(target, SyncState::Synced | SyncState::Idle),
            SyncState::Synced => matches!(target, SyncState::Syncing | SyncState::Idle),
        }
    }
}

impl Default for SyncState {
    fn default() -> Self {
        SyncState::Idle
    }
}

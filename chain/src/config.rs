use std::time::Duration;

pub const SLOTS_PER_EPOCH: u64 = 32;
pub const SECONDS_PER_SLOT: u64 = 12;
pub const SECONDS_PER_EPOCH: u64 = SECONDS_PER_SLOT * SLOTS_PER_EPOCH;

#[derive(Clone, Debug)]
pub struct ChainConfig {
    pub seconds_per_slot: u64,
    pub slots_per_epoch: u64,
}

impl ChainConfig {
    pub fn epoch_duration(&self) -> Duration {
        Duration::from_secs(self.seconds_per_slot * self.slots_per_epoch)
    }

    /// Number of whole slots elapsed since genesis at `now_secs`.
    pub fn slots_since_genesis(&self, genesis_secs: u64, now_secs: u64) -> u64 {
        now_secs.saturating_sub(genesis_secs) / self.seconds_per_slot.max(1)
    }
}

pub const MAINNET_CONFIG: ChainConfig = ChainConfig {
    seconds_per_slot: SECONDS_PER_SLOT,
    slots_per_epoch: SLOTS_PER_EPOCH,
};

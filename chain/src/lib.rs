pub mod config;

pub use config::{ChainConfig, MAINNET_CONFIG, SECONDS_PER_EPOCH, SECONDS_PER_SLOT, SLOTS_PER_EPOCH};

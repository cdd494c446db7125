use libp2p_identity::PeerId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Per-peer admission control for block requests.
pub trait RateLimiter: Send + Sync {
    fn capacity(&self) -> u64;

    /// Blocks the peer's bucket can still take right now.
    fn remaining(&self, peer_id: &PeerId) -> u64;

    /// Puts `amount` blocks into the peer's bucket, clamped to what fits.
    /// Returns the amount actually admitted.
    fn add(&self, peer_id: &PeerId, amount: u64) -> u64;

    /// Time until the peer's bucket fully drains.
    fn till_empty(&self, peer_id: &PeerId) -> Duration;

    /// Forgets peers whose buckets have fully drained.
    fn prune(&self);
}

#[derive(Debug)]
struct Bucket {
    level: f64,
    updated: Instant,
}

impl Bucket {
    fn drain(&mut self, rate: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.updated).as_secs_f64();
        self.level = (self.level - elapsed * rate).max(0.0);
        self.updated = now;
    }
}

/// Token bucket per peer: requests fill a bucket of fixed capacity that
/// drains at a constant rate.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    capacity: u64,
    buckets: Mutex<HashMap<PeerId, Bucket>>,
}

impl TokenBucket {
    pub fn new(refill_rate: u64, capacity: u64) -> Self {
        Self {
            rate: refill_rate.max(1) as f64,
            capacity,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn level(&self, peer_id: &PeerId) -> f64 {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        match buckets.get_mut(peer_id) {
            Some(bucket) => {
                bucket.drain(self.rate, now);
                bucket.level
            }
            None => 0.0,
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_peers(&self) -> usize {
        self.buckets.lock().len()
    }
}

impl RateLimiter for TokenBucket {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn remaining(&self, peer_id: &PeerId) -> u64 {
        let level = self.level(peer_id).ceil() as u64;
        self.capacity.saturating_sub(level)
    }

    fn add(&self, peer_id: &PeerId, amount: u64) -> u64 {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(*peer_id)
            .or_insert(Bucket { level: 0.0, updated: now });
        bucket.drain(self.rate, now);

        let free = (self.capacity as f64 - bucket.level).max(0.0).floor() as u64;
        let admitted = amount.min(free);
        bucket.level += admitted as f64;
        admitted
    }

    fn till_empty(&self, peer_id: &PeerId) -> Duration {
        Duration::from_secs_f64(self.level(peer_id) / self.rate)
    }

    fn prune(&self) {
        let now = Instant::now();
        let rate = self.rate;
        self.buckets.lock().retain(|_, bucket| {
            bucket.drain(rate, now);
            bucket.level > 0.0
        });
    }
}

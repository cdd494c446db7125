pub mod server;

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
    #[error("metrics output is not valid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Sync engine metrics backed by a private prometheus registry.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    peers: IntGauge,
    head_slot: IntGauge,
    highest_expected_slot: IntGauge,
    state_machines: IntGaugeVec,
    // Fetcher
    fetch_requests: IntCounterVec,
    blocks_requested: IntCounter,
    request_duration: Histogram,
    rate_limit_waits: IntCounter,
    peer_penalties: IntCounter,
    // Queue / service
    queue_resets: IntCounterVec,
    blocks_processed: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let peers = IntGauge::with_opts(Opts::new("sync_peers_suitable", "Number of peers supporting the sync target"))?;
        registry.register(Box::new(peers.clone()))?;

        let head_slot = IntGauge::with_opts(Opts::new("sync_head_slot", "Head slot of the local chain"))?;
        registry.register(Box::new(head_slot.clone()))?;

        let highest_expected_slot = IntGauge::with_opts(Opts::new(
            "sync_highest_expected_slot",
            "Ceiling the blocks queue is syncing towards",
        ))?;
        registry.register(Box::new(highest_expected_slot.clone()))?;

        let state_machines = IntGaugeVec::new(
            Opts::new("sync_state_machines", "Number of range state machines per state"),
            &["state"],
        )?;
        registry.register(Box::new(state_machines.clone()))?;

        let fetch_requests = IntCounterVec::new(
            Opts::new("sync_fetch_requests_total", "Total number of blocks by range requests"),
            &["result"],
        )?;
        registry.register(Box::new(fetch_requests.clone()))?;

        let blocks_requested = IntCounter::with_opts(Opts::new(
            "sync_blocks_requested_total",
            "Total number of blocks asked from peers",
        ))?;
        registry.register(Box::new(blocks_requested.clone()))?;

        let request_duration = Histogram::with_opts(
            HistogramOpts::new("sync_request_duration_seconds", "Time taken by a single peer request")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        let rate_limit_waits = IntCounter::with_opts(Opts::new(
            "sync_rate_limit_waits_total",
            "Times a request waited for peer bandwidth",
        ))?;
        registry.register(Box::new(rate_limit_waits.clone()))?;

        let peer_penalties = IntCounter::with_opts(Opts::new(
            "sync_peer_penalties_total",
            "Peers penalized for invalid responses",
        ))?;
        registry.register(Box::new(peer_penalties.clone()))?;

        let queue_resets = IntCounterVec::new(
            Opts::new("sync_queue_resets_total", "Sliding window resets of the blocks queue"),
            &["kind"],
        )?;
        registry.register(Box::new(queue_resets.clone()))?;

        let blocks_processed = IntCounterVec::new(
            Opts::new("sync_blocks_processed_total", "Blocks handed to the chain by initial sync"),
            &["result"],
        )?;
        registry.register(Box::new(blocks_processed.clone()))?;

        Ok(Self {
            registry,
            peers,
            head_slot,
            highest_expected_slot,
            state_machines,
            fetch_requests,
            blocks_requested,
            request_duration,
            rate_limit_waits,
            peer_penalties,
            queue_resets,
            blocks_processed,
        })
    }

    pub fn gather(&self) -> Result<String, MetricsError> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::<u8>::new();
        TextEncoder::new().encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    pub fn set_peers(&self, count: usize) {
        self.peers.set(count as i64);
    }

    pub fn set_head_slot(&self, slot: u64) {
        self.head_slot.set(slot as i64);
    }

    pub fn set_highest_expected_slot(&self, slot: u64) {
        self.highest_expected_slot.set(slot as i64);
    }

    pub fn set_state_machines(&self, state: &str, count: usize) {
        self.state_machines.with_label_values(&[state]).set(count as i64);
    }

    pub fn inc_fetch_request(&self, result: &str) {
        self.fetch_requests.with_label_values(&[result]).inc();
    }

    pub fn add_blocks_requested(&self, count: u64) {
        self.blocks_requested.inc_by(count);
    }

    pub fn observe_request_duration(&self, seconds: f64) {
        self.request_duration.observe(seconds);
    }

    pub fn inc_rate_limit_waits(&self) {
        self.rate_limit_waits.inc();
    }

    pub fn inc_peer_penalties(&self) {
        self.peer_penalties.inc();
    }

    pub fn inc_queue_reset(&self, kind: &str) {
        self.queue_resets.with_label_values(&[kind]).inc();
    }

    pub fn inc_blocks_processed(&self, result: &str) {
        self.blocks_processed.with_label_values(&[result]).inc();
    }
}

pub type SharedMetrics = Arc<Metrics>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_contains_registered_metrics() {
        let metrics = Metrics::new().unwrap();
        metrics.set_head_slot(42);
        metrics.inc_fetch_request("ok");
        metrics.set_state_machines("sent", 3);

        let output = metrics.gather().unwrap();
        assert!(output.contains("sync_head_slot 42"));
        assert!(output.contains("sync_fetch_requests_total{result=\"ok\"} 1"));
        assert!(output.contains("sync_state_machines{state=\"sent\"} 3"));
    }

    #[test]
    fn test_registries_are_independent() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.inc_peer_penalties();
        assert!(a.gather().unwrap().contains("sync_peer_penalties_total 1"));
        assert!(b.gather().unwrap().contains("sync_peer_penalties_total 0"));
    }
}

use super::config::{
    SyncConfig, SyncMode, MAX_BAD_RESPONSES, MAX_PENDING_REQUESTS, PEERS_PERCENTAGE_PER_REQUEST,
    PEER_FILTER_CAPACITY_WEIGHT,
};
use super::error::SyncError;
use super::rate_limiter::{RateLimiter, TokenBucket};
use crate::types::{BlocksByRangeRequest, SyncServices};
use containers::{Bytes32, Epoch, SignedBeaconBlock, Slot};
use libp2p_identity::PeerId;
use metrics::Metrics;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Range a state machine asks the fetcher for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRequestParams {
    pub start: Slot,
    pub count: u64,
}

/// Outcome of a range fetch, posted back to the queue coordinator.
#[derive(Debug, Clone)]
pub struct FetchRequestResponse {
    pub start: Slot,
    pub count: u64,
    pub peer_id: Option<PeerId>,
    pub result: Result<Arc<[SignedBeaconBlock]>, SyncError>,
}

impl FetchRequestResponse {
    pub fn ok(params: FetchRequestParams, peer_id: PeerId, blocks: Vec<SignedBeaconBlock>) -> Self {
        Self {
            start: params.start,
            count: params.count,
            peer_id: Some(peer_id),
            result: Ok(blocks.into()),
        }
    }

    pub fn failed(params: FetchRequestParams, peer_id: Option<PeerId>, error: SyncError) -> Self {
        Self {
            start: params.start,
            count: params.count,
            peer_id,
            result: Err(error),
        }
    }
}

/// Downloads block ranges from peers.
///
/// Every request is admitted through a per-peer rate limiter, responses are
/// validated before they are handed out, and scheduled fetches run as
/// independent tasks reporting back over a channel.
pub struct BlocksFetcher {
    services: SyncServices,
    config: SyncConfig,
    rate_limiter: Arc<dyn RateLimiter>,
    peer_locks: Mutex<HashMap<PeerId, Arc<AsyncMutex<()>>>>,
    pending: Arc<Semaphore>,
    cancellation: CancellationToken,
}

impl BlocksFetcher {
    pub fn new(services: SyncServices, config: SyncConfig, cancellation: CancellationToken) -> Self {
        let rate_limiter = Arc::new(TokenBucket::new(
            config.rate_limiter_refill_rate,
            config.rate_limiter_capacity,
        ));

        Self {
            services,
            config,
            rate_limiter,
            peer_locks: Mutex::new(HashMap::new()),
            pending: Arc::new(Semaphore::new(MAX_PENDING_REQUESTS)),
            cancellation,
        }
    }

    pub fn with_rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    pub(crate) fn services(&self) -> &SyncServices {
        &self.services
    }

    pub(crate) fn metrics(&self) -> Option<&Metrics> {
        self.services.metrics.as_deref()
    }

    /// Cancels every outstanding and future request of this fetcher.
    pub fn stop(&self) {
        self.cancellation.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Starts fetching `params` in the background. The response is delivered
    /// on `responses`, including failures and cancellation.
    pub fn schedule_request(
        self: &Arc<Self>,
        params: FetchRequestParams,
        responses: mpsc::Sender<FetchRequestResponse>,
    ) -> Result<(), SyncError> {
        if self.is_stopped() {
            return Err(SyncError::FetcherCtxIsDone);
        }

        let fetcher = Arc::clone(self);
        tokio::spawn(async move {
            let response = tokio::select! {
                biased;
                _ = fetcher.cancellation.cancelled() => {
                    FetchRequestResponse::failed(params, None, SyncError::Cancelled)
                }
                response = fetcher.handle_pooled_request(params) => response,
            };

            if responses.send(response).await.is_err() {
                debug!(start = %params.start, "Queue is gone, dropping fetch response");
            }
        });

        Ok(())
    }

    async fn handle_pooled_request(&self, params: FetchRequestParams) -> FetchRequestResponse {
        let Ok(_permit) = self.pending.acquire().await else {
            return FetchRequestResponse::failed(params, None, SyncError::FetcherCtxIsDone);
        };
        self.handle_request(params).await
    }

    /// Fetches `params` from the best suitable peers.
    pub async fn handle_request(&self, params: FetchRequestParams) -> FetchRequestResponse {
        if self.is_stopped() {
            return FetchRequestResponse::failed(params, None, SyncError::Cancelled);
        }

        let (_, target_epoch, peers) = self.calculate_head_and_target_epochs();
        if peers.is_empty() {
            return FetchRequestResponse::failed(params, None, SyncError::NoPeersAvailable);
        }

        // Short circuit start far exceeding the highest finalized epoch in some infinite loop.
        if self.config.mode == SyncMode::StopOnFinalizedEpoch {
            let highest_finalized_slot = (target_epoch + 1).start_slot();
            if params.start > highest_finalized_slot {
                debug!(
                    start = %params.start,
                    highest_finalized_slot = %highest_finalized_slot,
                    "Range is beyond the highest finalized slot"
                );
                return FetchRequestResponse::failed(params, None, SyncError::SlotIsTooHigh);
            }
        }

        let (peer_id, result) = self.fetch_blocks_from_peer(params, peers).await;
        if let Some(metrics) = self.metrics() {
            metrics.inc_fetch_request(if result.is_ok() { "ok" } else { "error" });
        }

        match (peer_id, result) {
            (Some(peer_id), Ok(blocks)) => FetchRequestResponse::ok(params, peer_id, blocks),
            (None, Ok(_)) => FetchRequestResponse::failed(params, None, SyncError::NoPeersAvailable),
            (peer_id, Err(error)) => FetchRequestResponse::failed(params, peer_id, error),
        }
    }

    /// Tries peers one after another until one serves the range.
    ///
    /// Invalid data ends the attempt immediately so the caller can penalize
    /// the peer that sent it.
    async fn fetch_blocks_from_peer(
        &self,
        params: FetchRequestParams,
        peers: Vec<PeerId>,
    ) -> (Option<PeerId>, Result<Vec<SignedBeaconBlock>, SyncError>) {
        let peers = self.filter_peers(peers, PEERS_PERCENTAGE_PER_REQUEST);
        let request = BlocksByRangeRequest::new(params.start, params.count);

        for peer_id in peers {
            match self.request_blocks(request, peer_id).await {
                Ok(blocks) => return (Some(peer_id), Ok(blocks)),
                Err(SyncError::InvalidFetchedData) => {
                    return (Some(peer_id), Err(SyncError::InvalidFetchedData))
                }
                Err(error) if error.is_shutdown() => return (None, Err(error)),
                Err(error) => {
                    debug!(peer = %peer_id, start = %params.start, %error, "Could not request blocks by range");
                }
            }
        }

        (None, Err(SyncError::NoPeersAvailable))
    }

    /// Requests a range from a single peer, honouring its rate limit.
    pub async fn request_blocks(
        &self,
        request: BlocksByRangeRequest,
        peer_id: PeerId,
    ) -> Result<Vec<SignedBeaconBlock>, SyncError> {
        if self.is_stopped() {
            return Err(SyncError::Cancelled);
        }

        self.acquire_bandwidth(peer_id, request.count).await?;

        debug!(
            peer = %peer_id,
            start = %request.start_slot,
            count = request.count,
            step = request.step,
            "Requesting blocks"
        );
        if let Some(metrics) = self.metrics() {
            metrics.add_blocks_requested(request.count);
        }

        let blocks = self
            .send_request(self.services.network.blocks_by_range(peer_id, request))
            .await?;
        validate_range_response(&request, &blocks)?;

        Ok(blocks)
    }

    /// Requests blocks by root from a single peer, honouring its rate limit.
    pub async fn request_blocks_by_root(
        &self,
        roots: Vec<Bytes32>,
        peer_id: PeerId,
    ) -> Result<Vec<SignedBeaconBlock>, SyncError> {
        if self.is_stopped() {
            return Err(SyncError::Cancelled);
        }

        self.acquire_bandwidth(peer_id, roots.len() as u64).await?;

        debug!(peer = %peer_id, num_roots = roots.len(), "Requesting blocks by root");

        let requested: HashSet<Bytes32> = roots.iter().copied().collect();
        let blocks = self
            .send_request(self.services.network.blocks_by_root(peer_id, roots))
            .await?;

        if blocks.len() > requested.len() || blocks.iter().any(|block| !requested.contains(&block.root())) {
            return Err(SyncError::InvalidFetchedData);
        }

        Ok(blocks)
    }

    async fn send_request<F>(&self, request: F) -> Result<Vec<SignedBeaconBlock>, SyncError>
    where
        F: Future<Output = anyhow::Result<Vec<SignedBeaconBlock>>>,
    {
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Err(SyncError::Cancelled),
            result = tokio::time::timeout(self.config.request_timeout, request) => match result {
                Ok(Ok(blocks)) => Ok(blocks),
                Ok(Err(error)) => Err(SyncError::Network(format!("{error:#}"))),
                Err(_) => Err(SyncError::RequestTimeout),
            },
        };

        if let Some(metrics) = self.metrics() {
            metrics.observe_request_duration(started.elapsed().as_secs_f64());
        }

        result
    }

    /// Reserves `amount` blocks of the peer's budget, waiting for the bucket
    /// to drain when it does not fit.
    async fn acquire_bandwidth(&self, peer_id: PeerId, amount: u64) -> Result<(), SyncError> {
        let lock = self.peer_lock(peer_id);
        let _guard = lock.lock().await;

        if self.rate_limiter.remaining(&peer_id) < amount {
            self.wait_for_bandwidth(peer_id).await?;
        }
        self.rate_limiter.add(&peer_id, amount);

        Ok(())
    }

    async fn wait_for_bandwidth(&self, peer_id: PeerId) -> Result<(), SyncError> {
        let wait = self.rate_limiter.till_empty(&peer_id);
        debug!(peer = %peer_id, wait_ms = wait.as_millis() as u64, "Slowing down for rate limit");
        if let Some(metrics) = self.metrics() {
            metrics.inc_rate_limit_waits();
        }

        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Err(SyncError::FetcherCtxIsDone),
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }

    fn peer_lock(&self, peer_id: PeerId) -> Arc<AsyncMutex<()>> {
        Arc::clone(self.peer_locks.lock().entry(peer_id).or_default())
    }

    /// Orders peers by score and keeps the best share of them.
    ///
    /// The score mixes the peer's track record with its remaining rate
    /// limiter capacity. Peers are shuffled first so equal scores do not
    /// always hit the same peer.
    pub fn filter_peers(&self, mut peers: Vec<PeerId>, percentage: f64) -> Vec<PeerId> {
        if peers.is_empty() {
            return peers;
        }

        peers.shuffle(&mut rand::thread_rng());
        // Peers that went away would otherwise keep their buckets forever.
        self.rate_limiter.prune();

        let capacity = self.rate_limiter.capacity().max(1) as f64;
        let batch_size = self.config.batch_size as f64;
        let mut scored = peers
            .into_iter()
            .filter_map(|peer_id| {
                let bad_responses = self.services.peers.bad_responses(&peer_id);
                if bad_responses >= MAX_BAD_RESPONSES {
                    return None;
                }

                let remaining = self.rate_limiter.remaining(&peer_id) as f64;
                // Nearly exhausted peers go last; they would only make us wait.
                let score = if remaining < batch_size {
                    0.0
                } else {
                    let provider_score = 1.0 / (1.0 + bad_responses as f64);
                    let capacity_score = remaining / capacity;
                    provider_score * (1.0 - PEER_FILTER_CAPACITY_WEIGHT)
                        + capacity_score * PEER_FILTER_CAPACITY_WEIGHT
                };
                Some((peer_id, score))
            })
            .collect::<Vec<_>>();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1));

        let peers = scored.into_iter().map(|(peer_id, _)| peer_id).collect();
        trim_peers(peers, percentage, self.config.required_peers())
    }

    /// Our progress epoch, the epoch we sync towards, and the peers that can
    /// serve it.
    pub fn calculate_head_and_target_epochs(&self) -> (Epoch, Epoch, Vec<PeerId>) {
        let head_epoch = self.services.chain.head_slot().epoch();

        match self.config.mode {
            SyncMode::StopOnFinalizedEpoch => {
                let finalized_epoch = self.services.finalization.finalized_checkpoint().epoch;
                let (target_epoch, peers) = self
                    .services
                    .peers
                    .best_finalized(self.config.max_peers_to_sync, finalized_epoch);
                (finalized_epoch.min(head_epoch), target_epoch, peers)
            }
            SyncMode::NonConstrained => {
                let (target_epoch, peers) = self.services.peers.best_non_finalized(head_epoch);
                (head_epoch, target_epoch, peers)
            }
        }
    }

    /// First slot of the best finalized epoch among peers.
    pub fn best_finalized_slot(&self) -> Slot {
        let finalized_epoch = self.services.finalization.finalized_checkpoint().epoch;
        let (epoch, _) = self
            .services
            .peers
            .best_finalized(self.config.max_peers_to_sync, finalized_epoch);
        epoch.start_slot()
    }

    /// First slot of the best head epoch among peers.
    pub fn best_non_finalized_slot(&self) -> Slot {
        let head_epoch = self.services.chain.head_slot().epoch();
        let (epoch, _) = self.services.peers.best_non_finalized(head_epoch);
        epoch.start_slot()
    }
}

fn trim_peers(mut peers: Vec<PeerId>, percentage: f64, required: usize) -> Vec<PeerId> {
    let limit = (peers.len() as f64 * percentage).round() as usize;
    let limit = limit.max(required).max(1).min(peers.len());
    peers.truncate(limit);
    peers
}

/// Checks a range response against the request that produced it.
///
/// Blocks must be in range, aligned to the step, strictly ascending and,
/// for contiguous requests, each must build on the previous one.
pub fn validate_range_response(
    request: &BlocksByRangeRequest,
    blocks: &[SignedBeaconBlock],
) -> Result<(), SyncError> {
    if request.step == 0 || blocks.len() as u64 > request.count {
        return Err(SyncError::InvalidFetchedData);
    }

    let end = request.end_slot();
    let mut previous: Option<(Slot, Bytes32)> = None;

    for block in blocks {
        let slot = block.slot();
        if slot < request.start_slot || slot >= end {
            return Err(SyncError::InvalidFetchedData);
        }
        if slot.distance_from(request.start_slot) % request.step != 0 {
            return Err(SyncError::InvalidFetchedData);
        }
        if let Some((previous_slot, previous_root)) = previous {
            if slot <= previous_slot {
                return Err(SyncError::InvalidFetchedData);
            }
            if request.step == 1 && block.parent_root() != previous_root {
                return Err(SyncError::InvalidFetchedData);
            }
        }
        previous = Some((slot, block.root()));
    }

    Ok(())
}

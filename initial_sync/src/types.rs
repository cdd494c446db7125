use anyhow::Result;
use async_trait::async_trait;
use containers::{Bytes32, Checkpoint, Epoch, SignedBeaconBlock, Slot, Status};
use libp2p_identity::PeerId;
use metrics::SharedMetrics;
use serde::Serialize;
use std::sync::Arc;

/// Peer connection state.
///
/// DISCONNECTED -> CONNECTING -> CONNECTED -> DISCONNECTING -> DISCONNECTED
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No active connection to this peer.
    Disconnected,
    /// Transport connection in progress.
    Connecting,
    /// Transport established, can exchange protocol messages.
    Connected,
    /// Graceful shutdown in progress.
    Disconnecting,
}

/// Parameters of a `BeaconBlocksByRange` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlocksByRangeRequest {
    pub start_slot: Slot,
    pub count: u64,
    pub step: u64,
}

impl BlocksByRangeRequest {
    pub fn new(start_slot: Slot, count: u64) -> Self {
        Self { start_slot, count, step: 1 }
    }

    pub fn with_step(start_slot: Slot, count: u64, step: u64) -> Self {
        Self { start_slot, count, step }
    }

    /// First slot past the requested range.
    pub fn end_slot(&self) -> Slot {
        self.start_slot + self.count.saturating_mul(self.step)
    }
}

/// Connected peers and the chain state they advertise.
///
/// Peer scoring lives behind this trait as well: sync only reports bad
/// responses and processed blocks, it never owns scores.
pub trait PeerSet: Send + Sync {
    fn connected(&self) -> Vec<PeerId>;

    fn chain_state(&self, peer_id: &PeerId) -> Option<Status>;

    fn bad_responses(&self, peer_id: &PeerId) -> usize;

    fn penalize(&self, peer_id: &PeerId);

    fn record_processed_blocks(&self, peer_id: &PeerId, count: u64);

    /// Highest finalized epoch reported by connected peers that are not
    /// behind `our_finalized`, with the peers supporting it (highest epoch
    /// first, at most `max_peers`).
    fn best_finalized(&self, max_peers: usize, our_finalized: Epoch) -> (Epoch, Vec<PeerId>) {
        let mut candidates = self
            .connected()
            .into_iter()
            .filter_map(|peer_id| {
                let status = self.chain_state(&peer_id)?;
                (status.finalized.epoch >= our_finalized).then_some((peer_id, status.finalized.epoch))
            })
            .collect::<Vec<_>>();

        let Some(target) = candidates.iter().map(|(_, epoch)| *epoch).max() else {
            return (Epoch(0), Vec::new());
        };

        candidates.retain(|(_, epoch)| *epoch >= target);
        candidates.sort_by(|a, b| b.1.cmp(&a.1));
        candidates.truncate(max_peers);

        (target, candidates.into_iter().map(|(peer_id, _)| peer_id).collect())
    }

    /// Highest head epoch among peers whose head is past the start of
    /// `our_head_epoch`, with the peers at or above it (highest head first).
    fn best_non_finalized(&self, our_head_epoch: Epoch) -> (Epoch, Vec<PeerId>) {
        let floor = our_head_epoch.start_slot();
        let mut candidates = self
            .connected()
            .into_iter()
            .filter_map(|peer_id| {
                let status = self.chain_state(&peer_id)?;
                (status.head_slot > floor).then_some((peer_id, status.head_slot))
            })
            .collect::<Vec<_>>();

        let Some(target) = candidates.iter().map(|(_, slot)| slot.epoch()).max() else {
            return (Epoch(0), Vec::new());
        };

        candidates.retain(|(_, slot)| slot.epoch() >= target);
        candidates.sort_by(|a, b| b.1.cmp(&a.1));

        (target, candidates.into_iter().map(|(peer_id, _)| peer_id).collect())
    }
}

/// Request/response access to peers.
#[async_trait]
pub trait NetworkRequester: Send + Sync {
    async fn blocks_by_range(
        &self,
        peer_id: PeerId,
        request: BlocksByRangeRequest,
    ) -> Result<Vec<SignedBeaconBlock>>;

    async fn blocks_by_root(&self, peer_id: PeerId, roots: Vec<Bytes32>) -> Result<Vec<SignedBeaconBlock>>;
}

/// The chain that sync feeds: applies state transitions and stores blocks.
#[async_trait]
pub trait BlockConsumer: Send + Sync {
    fn head_slot(&self) -> Slot;

    fn has_block(&self, root: &Bytes32) -> bool;

    async fn receive_block(&self, block: SignedBeaconBlock, root: Bytes32) -> Result<()>;
}

pub trait FinalizationFetcher: Send + Sync {
    fn finalized_checkpoint(&self) -> Checkpoint;
}

/// Collaborators a sync run is wired to.
#[derive(Clone)]
pub struct SyncServices {
    pub chain: Arc<dyn BlockConsumer>,
    pub finalization: Arc<dyn FinalizationFetcher>,
    pub peers: Arc<dyn PeerSet>,
    pub network: Arc<dyn NetworkRequester>,
    pub metrics: Option<SharedMetrics>,
}

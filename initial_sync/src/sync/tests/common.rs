use crate::sync::{PeerManager, SyncConfig};
use crate::types::{
    BlockConsumer, BlocksByRangeRequest, ConnectionState, FinalizationFetcher, NetworkRequester, SyncServices,
};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use containers::{
    BeaconBlock, BeaconBlockBody, Bytes32, Checkpoint, Epoch, SignedBeaconBlock, Slot, Status, ValidatorIndex,
};
use libp2p_identity::PeerId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn create_test_block(slot: u64, parent_root: Bytes32, graffiti: u8) -> SignedBeaconBlock {
    SignedBeaconBlock {
        message: BeaconBlock {
            slot: Slot(slot),
            proposer_index: ValidatorIndex(slot % 64),
            parent_root,
            state_root: Bytes32::default(),
            body: BeaconBlockBody {
                graffiti: Bytes32::from([graffiti; 32]),
                execution_payload_hash: Bytes32::default(),
            },
        },
        signature: Default::default(),
    }
}

/// Chain with a genesis block at slot 0 and a block at every slot in
/// `1..=last` accepted by `has_block`.
pub fn make_chain(last: u64, has_block: impl Fn(u64) -> bool) -> Vec<SignedBeaconBlock> {
    let genesis = create_test_block(0, Bytes32::ZERO, 0);
    extend_chain(vec![genesis], last, has_block, 0)
}

/// Appends blocks up to `last` on top of the chain's last block.
pub fn extend_chain(
    mut chain: Vec<SignedBeaconBlock>,
    last: u64,
    has_block: impl Fn(u64) -> bool,
    graffiti: u8,
) -> Vec<SignedBeaconBlock> {
    let Some(tip) = chain.last() else {
        return chain;
    };
    let mut parent_root = tip.root();
    let first = tip.slot().0 + 1;

    for slot in first..=last {
        if !has_block(slot) {
            continue;
        }
        let block = create_test_block(slot, parent_root, graffiti);
        parent_root = block.root();
        chain.push(block);
    }
    chain
}

pub fn up_to(chain: &[SignedBeaconBlock], last: u64) -> Vec<SignedBeaconBlock> {
    chain.iter().filter(|block| block.slot().0 <= last).cloned().collect()
}

pub fn slots(blocks: &[SignedBeaconBlock]) -> Vec<u64> {
    blocks.iter().map(|block| block.slot().0).collect()
}

/// Local chain: accepts blocks whose parent it already has.
pub struct MockChain {
    blocks: RwLock<HashMap<Bytes32, SignedBeaconBlock>>,
    head: RwLock<Slot>,
    finalized: RwLock<Checkpoint>,
    received: RwLock<Vec<Slot>>,
}

impl MockChain {
    /// Chain holding `blocks`, the first of which is genesis.
    pub fn new(blocks: &[SignedBeaconBlock]) -> Self {
        let head = blocks.iter().map(SignedBeaconBlock::slot).max().unwrap_or_default();
        let blocks = blocks.iter().map(|block| (block.root(), block.clone())).collect();
        Self {
            blocks: RwLock::new(blocks),
            head: RwLock::new(head),
            finalized: RwLock::new(Checkpoint::default()),
            received: RwLock::new(Vec::new()),
        }
    }

    pub fn set_finalized(&self, epoch: u64) {
        *self.finalized.write() = Checkpoint::new(Epoch(epoch), Bytes32::ZERO);
    }

    /// Slots of blocks received through `receive_block`, in arrival order.
    pub fn received(&self) -> Vec<u64> {
        self.received.read().iter().map(|slot| slot.0).collect()
    }
}

#[async_trait]
impl BlockConsumer for MockChain {
    fn head_slot(&self) -> Slot {
        *self.head.read()
    }

    fn has_block(&self, root: &Bytes32) -> bool {
        self.blocks.read().contains_key(root)
    }

    async fn receive_block(&self, block: SignedBeaconBlock, root: Bytes32) -> Result<()> {
        let mut blocks = self.blocks.write();
        if !blocks.contains_key(&block.parent_root()) {
            bail!("unknown parent {}", block.parent_root());
        }

        let slot = block.slot();
        blocks.insert(root, block);
        self.received.write().push(slot);

        let mut head = self.head.write();
        if slot > *head {
            *head = slot;
        }
        Ok(())
    }
}

impl FinalizationFetcher for MockChain {
    fn finalized_checkpoint(&self) -> Checkpoint {
        *self.finalized.read()
    }
}

#[derive(Default)]
struct MockPeer {
    blocks: Vec<SignedBeaconBlock>,
    /// Requests starting inside one of these ranges fail.
    failing: Vec<(u64, u64)>,
    /// Requests starting inside one of these ranges get no blocks.
    withheld: Vec<(u64, u64)>,
    latency: Duration,
    corrupt: bool,
}

/// Serves per-peer chains over the request/response interface.
#[derive(Default)]
pub struct MockNetwork {
    peers: RwLock<HashMap<PeerId, MockPeer>>,
    requests: AtomicUsize,
}

impl MockNetwork {
    pub fn serve(&self, peer_id: PeerId, blocks: Vec<SignedBeaconBlock>) {
        self.peers.write().insert(peer_id, MockPeer { blocks, ..Default::default() });
    }

    pub fn fail_range(&self, peer_id: &PeerId, from: u64, to: u64) {
        if let Some(peer) = self.peers.write().get_mut(peer_id) {
            peer.failing.push((from, to));
        }
    }

    /// The peer claims to have no blocks for requests starting in `from..=to`.
    pub fn withhold_range(&self, peer_id: &PeerId, from: u64, to: u64) {
        if let Some(peer) = self.peers.write().get_mut(peer_id) {
            peer.withheld.push((from, to));
        }
    }

    pub fn set_latency(&self, peer_id: &PeerId, latency: Duration) {
        if let Some(peer) = self.peers.write().get_mut(peer_id) {
            peer.latency = latency;
        }
    }

    /// The peer answers range requests with blocks in reverse order.
    pub fn corrupt(&self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.write().get_mut(peer_id) {
            peer.corrupt = true;
        }
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }

    fn latency(&self, peer_id: &PeerId) -> Duration {
        self.peers.read().get(peer_id).map_or(Duration::ZERO, |peer| peer.latency)
    }
}

#[async_trait]
impl NetworkRequester for MockNetwork {
    async fn blocks_by_range(&self, peer_id: PeerId, request: BlocksByRangeRequest) -> Result<Vec<SignedBeaconBlock>> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let latency = self.latency(&peer_id);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let peers = self.peers.read();
        let peer = peers.get(&peer_id).ok_or_else(|| anyhow!("unknown peer"))?;

        let start = request.start_slot.0;
        if peer.failing.iter().any(|(from, to)| (*from..=*to).contains(&start)) {
            bail!("stream reset");
        }
        if peer.withheld.iter().any(|(from, to)| (*from..=*to).contains(&start)) {
            return Ok(Vec::new());
        }

        let end = request.end_slot().0;
        let mut blocks = peer
            .blocks
            .iter()
            .filter(|block| {
                let slot = block.slot().0;
                slot >= start && slot < end && (slot - start) % request.step.max(1) == 0
            })
            .take(request.count as usize)
            .cloned()
            .collect::<Vec<_>>();

        if peer.corrupt {
            blocks.reverse();
        }
        Ok(blocks)
    }

    async fn blocks_by_root(&self, peer_id: PeerId, roots: Vec<Bytes32>) -> Result<Vec<SignedBeaconBlock>> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let peers = self.peers.read();
        let peer = peers.get(&peer_id).ok_or_else(|| anyhow!("unknown peer"))?;

        Ok(peer
            .blocks
            .iter()
            .filter(|block| roots.contains(&block.root()))
            .cloned()
            .collect())
    }
}

/// Local chain, peers and network wired together.
pub struct TestEnv {
    pub chain: Arc<MockChain>,
    pub peers: Arc<PeerManager>,
    pub network: Arc<MockNetwork>,
}

impl TestEnv {
    pub fn new(local: &[SignedBeaconBlock]) -> Self {
        Self {
            chain: Arc::new(MockChain::new(local)),
            peers: Arc::new(PeerManager::new()),
            network: Arc::new(MockNetwork::default()),
        }
    }

    /// Connects a peer serving `blocks` and advertising `finalized_epoch`.
    pub fn add_peer(&self, blocks: Vec<SignedBeaconBlock>, finalized_epoch: u64) -> PeerId {
        let peer_id = PeerId::random();
        let (head_slot, head_root) = blocks
            .last()
            .map_or((Slot(0), Bytes32::ZERO), |block| (block.slot(), block.root()));

        self.peers.add_peer(peer_id, ConnectionState::Connected);
        self.peers.update_status(
            &peer_id,
            Status::new(Checkpoint::new(Epoch(finalized_epoch), Bytes32::ZERO), head_root, head_slot),
        );
        self.network.serve(peer_id, blocks);
        peer_id
    }

    pub fn services(&self) -> SyncServices {
        SyncServices {
            chain: self.chain.clone(),
            finalization: self.chain.clone(),
            peers: self.peers.clone(),
            network: self.network.clone(),
            metrics: None,
        }
    }
}

/// Fast polling, a single required peer and no practical rate limit.
pub fn test_config() -> SyncConfig {
    SyncConfig::default()
        .with_rate_limiter(1_000_000, 1_000_000)
        .with_polling_interval(Duration::from_millis(10))
        .with_minimum_sync_peers(1)
}

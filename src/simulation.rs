use anyhow::{bail, ensure, Context, Result};
use async_trait::async_trait;
use chain::{MAINNET_CONFIG, SLOTS_PER_EPOCH};
use containers::{
    BeaconBlock, BeaconBlockBody, Bytes32, Checkpoint, Signature, SignedBeaconBlock, Slot, Status, ValidatorIndex,
};
use initial_sync::sync::{InitialSync, PeerManager, SyncConfig, SyncStats};
use initial_sync::types::{
    BlockConsumer, BlocksByRangeRequest, ConnectionState, FinalizationFetcher, NetworkRequester, SyncServices,
};
use libp2p_identity::PeerId;
use metrics::SharedMetrics;
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub peers: usize,
    pub lagging_peers: usize,
    pub chain_length: u64,
    /// Epochs between the canonical head and the finalized checkpoint peers report.
    pub finalized_distance: u64,
    pub skip_probability: f64,
    pub failure_probability: f64,
    pub latency: Duration,
    pub seed: u64,
    pub sync: SyncConfig,
}

#[derive(Debug)]
pub struct SimulationReport {
    pub head_slot: Slot,
    pub canonical_head_slot: Slot,
    pub imported_blocks: usize,
    pub elapsed: Duration,
    pub stats: SyncStats,
}

/// Canonical chain with a genesis block and randomly skipped slots.
pub fn build_chain(length: u64, skip_probability: f64, rng: &mut StdRng) -> Vec<SignedBeaconBlock> {
    let genesis = SignedBeaconBlock::default();
    let mut parent_root = genesis.root();
    let mut chain = vec![genesis];

    for slot in 1..=length {
        // The tip always exists so the chain length is exact.
        if slot != length && rng.gen_bool(skip_probability) {
            continue;
        }

        let mut graffiti = [0u8; 32];
        rng.fill(&mut graffiti);
        let block = SignedBeaconBlock {
            message: BeaconBlock {
                slot: Slot(slot),
                proposer_index: ValidatorIndex(rng.gen_range(0..1024)),
                parent_root,
                state_root: Bytes32::from(graffiti),
                body: BeaconBlockBody { graffiti: Bytes32::from(graffiti), ..Default::default() },
            },
            signature: Signature(vec![0; 96]),
        };
        parent_root = block.root();
        chain.push(block);
    }

    chain
}

struct SimulatedPeer {
    blocks: Arc<Vec<SignedBeaconBlock>>,
    head_slot: Slot,
    failure_probability: f64,
    latency: Duration,
}

/// Peers answering from their view of the canonical chain.
#[derive(Default)]
struct SimulatedNetwork {
    peers: RwLock<HashMap<PeerId, SimulatedPeer>>,
}

impl SimulatedNetwork {
    fn add_peer(&self, peer_id: PeerId, peer: SimulatedPeer) {
        self.peers.write().insert(peer_id, peer);
    }

    fn peer_view(&self, peer_id: &PeerId) -> Result<(Arc<Vec<SignedBeaconBlock>>, Slot, f64, Duration)> {
        let peers = self.peers.read();
        let peer = peers.get(peer_id).context("unknown peer")?;
        Ok((peer.blocks.clone(), peer.head_slot, peer.failure_probability, peer.latency))
    }
}

async fn simulate_latency(latency: Duration, failure_probability: f64) -> Result<()> {
    let (jitter, fail) = {
        let mut rng = rand::thread_rng();
        let jitter = rng.gen_range(0..=latency.as_millis() as u64);
        (Duration::from_millis(jitter), rng.gen_bool(failure_probability))
    };

    tokio::time::sleep(latency + jitter).await;
    if fail {
        bail!("stream reset by peer");
    }
    Ok(())
}

#[async_trait]
impl NetworkRequester for SimulatedNetwork {
    async fn blocks_by_range(&self, peer_id: PeerId, request: BlocksByRangeRequest) -> Result<Vec<SignedBeaconBlock>> {
        let (blocks, head_slot, failure_probability, latency) = self.peer_view(&peer_id)?;
        simulate_latency(latency, failure_probability).await?;

        let start = request.start_slot;
        let end = request.end_slot().min(head_slot + 1);
        let step = request.step.max(1);
        let first = blocks.partition_point(|block| block.slot() < start);

        Ok(blocks[first..]
            .iter()
            .take_while(|block| block.slot() < end)
            .filter(|block| block.slot().distance_from(start) % step == 0)
            .take(request.count as usize)
            .cloned()
            .collect())
    }

    async fn blocks_by_root(&self, peer_id: PeerId, roots: Vec<Bytes32>) -> Result<Vec<SignedBeaconBlock>> {
        let (blocks, head_slot, failure_probability, latency) = self.peer_view(&peer_id)?;
        simulate_latency(latency, failure_probability).await?;

        Ok(blocks
            .iter()
            .filter(|block| block.slot() <= head_slot && roots.contains(&block.root()))
            .cloned()
            .collect())
    }
}

/// Local chain store fed by sync.
struct InMemoryChain {
    blocks: RwLock<HashMap<Bytes32, Slot>>,
    head: RwLock<Slot>,
    imported: RwLock<Vec<Slot>>,
}

impl InMemoryChain {
    fn new(genesis: &SignedBeaconBlock) -> Self {
        Self {
            blocks: RwLock::new(HashMap::from([(genesis.root(), genesis.slot())])),
            head: RwLock::new(genesis.slot()),
            imported: RwLock::new(Vec::new()),
        }
    }
}

#[async_trait]
impl BlockConsumer for InMemoryChain {
    fn head_slot(&self) -> Slot {
        *self.head.read()
    }

    fn has_block(&self, root: &Bytes32) -> bool {
        self.blocks.read().contains_key(root)
    }

    async fn receive_block(&self, block: SignedBeaconBlock, root: Bytes32) -> Result<()> {
        let slot = block.slot();
        let mut blocks = self.blocks.write();
        let Some(parent_slot) = blocks.get(&block.parent_root()).copied() else {
            bail!("parent {} of block at slot {slot} is unknown", block.parent_root());
        };
        ensure!(parent_slot < slot, "block at slot {slot} does not descend from slot {parent_slot}");

        blocks.insert(root, slot);
        self.imported.write().push(slot);
        let mut head = self.head.write();
        if slot > *head {
            *head = slot;
        }
        Ok(())
    }
}

impl FinalizationFetcher for InMemoryChain {
    fn finalized_checkpoint(&self) -> Checkpoint {
        Checkpoint::default()
    }
}

/// Syncs an empty node against simulated peers and checks the result.
pub async fn run(
    config: SimulationConfig,
    metrics: Option<SharedMetrics>,
    cancellation: CancellationToken,
) -> Result<SimulationReport> {
    ensure!(config.peers > 0, "at least one peer is required");

    let mut rng = StdRng::seed_from_u64(config.seed);
    let canonical = Arc::new(build_chain(config.chain_length, config.skip_probability, &mut rng));
    let canonical_head = canonical.last().map(SignedBeaconBlock::slot).unwrap_or_default();
    info!(
        head_slot = %canonical_head,
        num_blocks = canonical.len(),
        "Built canonical chain"
    );

    let chain = Arc::new(InMemoryChain::new(&canonical[0]));
    let peers = Arc::new(PeerManager::new());
    let network = Arc::new(SimulatedNetwork::default());

    for index in 0..config.peers {
        let peer_id = PeerId::random();
        // Lagging peers are a few epochs behind the rest.
        let lag = if index < config.lagging_peers {
            rng.gen_range(1..=4) * SLOTS_PER_EPOCH
        } else {
            0
        };
        let head_slot = canonical_head.saturating_sub(lag);
        let head_root = canonical
            .iter()
            .rev()
            .find(|block| block.slot() <= head_slot)
            .map_or(Bytes32::ZERO, SignedBeaconBlock::root);
        let finalized_epoch = head_slot.epoch().saturating_sub(config.finalized_distance);

        peers.add_peer(peer_id, ConnectionState::Connected);
        peers.update_status(
            &peer_id,
            Status::new(Checkpoint::new(finalized_epoch, Bytes32::ZERO), head_root, head_slot),
        );
        network.add_peer(
            peer_id,
            SimulatedPeer {
                blocks: canonical.clone(),
                head_slot,
                failure_probability: config.failure_probability,
                latency: config.latency,
            },
        );
        debug!(peer = %peer_id, head_slot = %head_slot, finalized_epoch = %finalized_epoch, "Simulated peer connected");
    }

    let services = SyncServices {
        chain: chain.clone(),
        finalization: chain.clone(),
        peers: peers.clone(),
        network,
        metrics,
    };

    // Genesis is placed so that the wall clock is at the canonical tip.
    let now_secs = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    let genesis_secs = now_secs.saturating_sub(canonical_head.0 * MAINNET_CONFIG.seconds_per_slot);
    let current_slot = Slot(MAINNET_CONFIG.slots_since_genesis(genesis_secs, now_secs));

    let started = Instant::now();
    let mut sync = InitialSync::new(services, config.sync, cancellation);
    sync.run(current_slot).await.context("initial sync failed")?;
    let elapsed = started.elapsed();

    let imported = chain.imported.read().clone();
    ensure!(
        imported.windows(2).all(|pair| pair[0] < pair[1]),
        "blocks were not imported in ascending slot order"
    );

    let head_slot = chain.head_slot();
    let expected = canonical
        .iter()
        .skip(1)
        .map(SignedBeaconBlock::slot)
        .take_while(|slot| *slot <= head_slot)
        .collect::<Vec<_>>();
    ensure!(imported == expected, "imported blocks differ from the canonical chain");

    Ok(SimulationReport {
        head_slot,
        canonical_head_slot: canonical_head,
        imported_blocks: imported.len(),
        elapsed,
        stats: sync.get_stats(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use containers::Epoch;

    #[test]
    fn test_build_chain_is_linked() {
        let mut rng = StdRng::seed_from_u64(7);
        let chain = build_chain(200, 0.3, &mut rng);

        assert_eq!(chain.last().map(SignedBeaconBlock::slot), Some(Slot(200)));
        assert!(chain.len() < 201);
        assert!(chain.windows(2).all(|pair| pair[1].parent_root() == pair[0].root()));
    }

    #[tokio::test]
    async fn test_simulation_syncs_to_head() {
        let config = SimulationConfig {
            peers: 4,
            lagging_peers: 1,
            chain_length: 400,
            finalized_distance: 2,
            skip_probability: 0.2,
            failure_probability: 0.0,
            latency: Duration::from_millis(1),
            seed: 1,
            sync: SyncConfig::default()
                .with_rate_limiter(100_000, 100_000)
                .with_polling_interval(Duration::from_millis(10))
                .with_minimum_sync_peers(1),
        };

        let report = run(config, None, CancellationToken::new()).await.unwrap();

        assert_eq!(report.head_slot, report.canonical_head_slot);
        assert_eq!(report.stats.rejected_blocks, 0);
    }

    #[tokio::test]
    async fn test_simulation_rejects_zero_peers() {
        let config = SimulationConfig {
            peers: 0,
            lagging_peers: 0,
            chain_length: 10,
            finalized_distance: 0,
            skip_probability: 0.0,
            failure_probability: 0.0,
            latency: Duration::ZERO,
            seed: 1,
            sync: SyncConfig::default(),
        };

        assert!(run(config, None, CancellationToken::new()).await.is_err());
    }

    #[test]
    fn test_epoch_math_for_lagging_peers() {
        assert_eq!(Slot(100).epoch().saturating_sub(2), Epoch(1));
    }
}

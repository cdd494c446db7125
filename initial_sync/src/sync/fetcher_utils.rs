use super::config::{
    BACKTRACKING_MAX_HOPS, NON_SKIPPED_SLOTS_FULL_SEARCH_EPOCHS, PEERS_PERCENTAGE_PER_REQUEST,
};
use super::error::SyncError;
use super::fetcher::BlocksFetcher;
use crate::types::BlocksByRangeRequest;
use chain::SLOTS_PER_EPOCH;
use containers::{Epoch, SignedBeaconBlock, Slot};
use libp2p_identity::PeerId;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

/// Alternative history served by a peer.
///
/// Blocks are in ascending slot order and the first block's parent is known
/// to the local chain.
#[derive(Debug, Clone)]
pub struct ForkData {
    pub peer_id: PeerId,
    pub blocks: Vec<SignedBeaconBlock>,
}

impl BlocksFetcher {
    /// Smallest slot after `slot` holding a block, according to peers
    /// supporting the current sync target.
    pub async fn non_skipped_slot_after(&self, slot: Slot) -> Result<Slot, SyncError> {
        let (head_epoch, target_epoch, peers) = self.calculate_head_and_target_epochs();
        debug!(
            slot = %slot,
            head_epoch = %head_epoch,
            target_epoch = %target_epoch,
            num_peers = peers.len(),
            "Searching for non-skipped slot"
        );

        self.non_skipped_slot_after_with_peers_target(slot, peers, target_epoch)
            .await
    }

    /// Same as `non_skipped_slot_after` over a fixed peer set, searching no
    /// further than the end of `target_epoch`.
    pub async fn non_skipped_slot_after_with_peers_target(
        &self,
        slot: Slot,
        peers: Vec<PeerId>,
        target_epoch: Epoch,
    ) -> Result<Slot, SyncError> {
        let peers = self.filter_peers(peers, PEERS_PERCENTAGE_PER_REQUEST);
        if peers.is_empty() {
            return Err(SyncError::NoPeersAvailable);
        }

        let upper_bound = (target_epoch + 1).start_slot();
        if slot + 1 >= upper_bound {
            return Err(SyncError::SlotIsTooHigh);
        }

        let first_after = |blocks: &[SignedBeaconBlock]| {
            blocks
                .iter()
                .map(SignedBeaconBlock::slot)
                .find(|found| *found > slot && *found < upper_bound)
        };
        let mut peer_index = 0;

        // Scan the nearest epochs fully, one epoch per request.
        let full_search_end = (slot + 1 + NON_SKIPPED_SLOTS_FULL_SEARCH_EPOCHS * SLOTS_PER_EPOCH).min(upper_bound);
        let mut start = slot + 1;
        while start < full_search_end {
            let count = SLOTS_PER_EPOCH.min(full_search_end.distance_from(start));
            let request = BlocksByRangeRequest::new(start, count);
            let blocks = self.request_from_any(request, &peers, &mut peer_index).await?;
            if let Some(found) = first_after(&blocks) {
                return Ok(found);
            }
            start += SLOTS_PER_EPOCH;
        }

        // Too far to scan everything: probe each window with a strided request
        // from a random offset.
        let window = SLOTS_PER_EPOCH * SLOTS_PER_EPOCH / 2;
        let mut sampled = None;
        let mut index = full_search_end;
        while index < upper_bound {
            let offset = rand::thread_rng().gen_range(0..SLOTS_PER_EPOCH);
            let request = BlocksByRangeRequest::with_step(index + offset, SLOTS_PER_EPOCH / 2, SLOTS_PER_EPOCH);
            let blocks = self.request_from_any(request, &peers, &mut peer_index).await?;
            if let Some(found) = first_after(&blocks) {
                sampled = Some(found);
                break;
            }
            index += window;
        }

        let Some(sampled) = sampled else {
            return Err(SyncError::SlotIsTooHigh);
        };

        // The probe may have jumped over earlier blocks: fetch the epoch
        // before the hit and the hit's epoch in full.
        let start = (sampled - SLOTS_PER_EPOCH).epoch().start_slot();
        let request = BlocksByRangeRequest::new(start, 2 * SLOTS_PER_EPOCH);
        let blocks = self.request_from_any(request, &peers, &mut peer_index).await?;

        Ok(first_after(&blocks).map_or(sampled, |found| found.min(sampled)))
    }

    /// Sends `request` to peers in rotation until one of them answers.
    async fn request_from_any(
        &self,
        request: BlocksByRangeRequest,
        peers: &[PeerId],
        peer_index: &mut usize,
    ) -> Result<Vec<SignedBeaconBlock>, SyncError> {
        let mut last_error = SyncError::NoPeersAvailable;

        for _ in 0..peers.len() {
            let peer_id = peers[*peer_index % peers.len()];
            *peer_index += 1;

            match self.request_blocks(request, peer_id).await {
                Ok(blocks) => return Ok(blocks),
                Err(error) if error.is_shutdown() => return Err(error),
                Err(error) => {
                    debug!(peer = %peer_id, start = %request.start_slot, %error, "Probe request failed");
                    last_error = error;
                }
            }
        }

        Err(last_error)
    }

    /// Looks for a peer whose chain continues from a block we know but
    /// diverges from our own past `slot`.
    pub async fn find_fork(&self, slot: Slot) -> Result<ForkData, SyncError> {
        if slot < Slot(2 * SLOTS_PER_EPOCH) {
            return Err(SyncError::SlotTooLowToBacktrack(slot));
        }

        let finalized_epoch = self.services().finalization.finalized_checkpoint().epoch;
        if slot.epoch() <= finalized_epoch {
            return Err(SyncError::NoBacktrackingNeeded(slot));
        }

        // Only peers that have seen more than us can offer an alternative.
        let peer_set = &self.services().peers;
        let mut peers = peer_set
            .connected()
            .into_iter()
            .filter(|peer_id| {
                peer_set
                    .chain_state(peer_id)
                    .is_some_and(|status| status.head_slot > slot)
            })
            .collect::<Vec<_>>();

        if peers.is_empty() {
            return Err(SyncError::NoPeersAvailable);
        }

        peers.shuffle(&mut rand::thread_rng());
        debug!(slot = %slot, num_peers = peers.len(), "Searching for alternative blocks");

        for peer_id in peers {
            match self.find_fork_with_peer(peer_id, slot).await {
                Ok(fork) => {
                    debug!(
                        peer = %peer_id,
                        first_slot = ?fork.blocks.first().map(SignedBeaconBlock::slot),
                        num_blocks = fork.blocks.len(),
                        "Found alternative blocks"
                    );
                    return Ok(fork);
                }
                Err(error) if error.is_shutdown() => return Err(error),
                Err(error) => debug!(peer = %peer_id, %error, "No alternative blocks found for peer"),
            }
        }

        Err(SyncError::NoPeersWithAltBlocks)
    }

    async fn find_fork_with_peer(&self, peer_id: PeerId, slot: Slot) -> Result<ForkData, SyncError> {
        let status = self
            .services()
            .peers
            .chain_state(&peer_id)
            .ok_or(SyncError::NoPeersAvailable)?;

        // The fork may start a bit before the slot we got stuck at.
        let search_from = slot - SLOTS_PER_EPOCH;
        let non_skipped = self
            .non_skipped_slot_after_with_peers_target(search_from, vec![peer_id], status.head_slot.epoch())
            .await?;

        let request = BlocksByRangeRequest::new(non_skipped, 2 * SLOTS_PER_EPOCH);
        let mut blocks = self.request_blocks(request, peer_id).await?;

        let chain = &self.services().chain;
        let Some(index) = blocks.iter().position(|block| !chain.has_block(&block.root())) else {
            return Err(SyncError::NoPeersWithAltBlocks);
        };
        let fork_blocks = blocks.split_off(index);

        // Responses are validated to be linked, so only the first unknown
        // block can have an unknown parent.
        let Some(first) = fork_blocks.first() else {
            return Err(SyncError::NoPeersWithAltBlocks);
        };
        if chain.has_block(&first.parent_root()) {
            return Ok(ForkData { peer_id, blocks: fork_blocks });
        }

        let mut ancestors = self.find_ancestor(peer_id, first).await?;
        ancestors.extend(fork_blocks);

        Ok(ForkData { peer_id, blocks: ancestors })
    }

    /// Walks parent roots of `block` back until one is known locally.
    ///
    /// Returns the missing ancestors in ascending order.
    pub async fn find_ancestor(
        &self,
        peer_id: PeerId,
        block: &SignedBeaconBlock,
    ) -> Result<Vec<SignedBeaconBlock>, SyncError> {
        let chain = &self.services().chain;
        let mut parent_root = block.parent_root();
        let mut ancestors = Vec::new();

        for _ in 0..BACKTRACKING_MAX_HOPS {
            if parent_root.is_zero() {
                break;
            }

            let mut blocks = self.request_blocks_by_root(vec![parent_root], peer_id).await?;
            let Some(parent) = blocks.pop() else {
                break;
            };

            parent_root = parent.parent_root();
            ancestors.push(parent);

            if chain.has_block(&parent_root) {
                ancestors.reverse();
                return Ok(ancestors);
            }
        }

        Err(SyncError::NoCommonAncestor)
    }
}

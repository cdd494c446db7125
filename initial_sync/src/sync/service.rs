//! Initial sync driver.
//!
//! `InitialSync` runs the queue in two rounds: first up to the best
//! finalized epoch peers agree on, then up to the current wall-clock slot.
//! Every batch the queue hands out is applied to the chain block by block.

use containers::{SignedBeaconBlock, Slot};
use libp2p_identity::PeerId;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    config::{SyncConfig, SyncMode, HANDSHAKE_POLLING_INTERVAL},
    error::SyncError,
    queue::{BlocksQueue, BlocksQueueConfig, FetchedData},
    states::SyncState,
};
use crate::types::SyncServices;

/// Round-robin initial sync over all suitable peers.
pub struct InitialSync {
    services: SyncServices,
    config: SyncConfig,
    state: SyncState,
    cancellation: CancellationToken,
    started: Option<Instant>,
    processed_blocks: u64,
    skipped_blocks: u64,
    rejected_blocks: u64,
}

impl InitialSync {
    pub fn new(services: SyncServices, config: SyncConfig, cancellation: CancellationToken) -> Self {
        Self {
            services,
            config,
            state: SyncState::default(),
            cancellation,
            started: None,
            processed_blocks: 0,
            skipped_blocks: 0,
            rejected_blocks: 0,
        }
    }

    /// Get current sync state.
    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Token that aborts the run when cancelled.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Syncs the local chain up to `current_slot`.
    ///
    /// Returns once the chain head reached the best slot peers can serve, or
    /// with `Cancelled` if the run was aborted.
    pub async fn run(&mut self, current_slot: Slot) -> Result<(), SyncError> {
        if current_slot == Slot(0) {
            info!("Chain is at genesis, nothing to sync");
            self.transition(SyncState::Synced);
            return Ok(());
        }

        self.transition(SyncState::Syncing);
        self.started = Some(Instant::now());

        self.wait_for_minimum_peers().await?;

        // Finalized ranges first: every suitable peer can serve them.
        let highest_finalized_slot = self.highest_finalized_slot();
        if self.services.chain.head_slot() < highest_finalized_slot {
            info!(
                head_slot = %self.services.chain.head_slot(),
                highest_expected_slot = %highest_finalized_slot,
                "Syncing to the best finalized slot"
            );
            self.run_queue(SyncMode::StopOnFinalizedEpoch, highest_finalized_slot).await?;
        }

        if self.services.chain.head_slot() < current_slot {
            info!(
                head_slot = %self.services.chain.head_slot(),
                current_slot = %current_slot,
                "Syncing to the latest head"
            );
            self.run_queue(SyncMode::NonConstrained, current_slot).await?;
        }

        let head_slot = self.services.chain.head_slot();
        self.transition(SyncState::Synced);
        info!(
            slot = %head_slot,
            processed = self.processed_blocks,
            skipped = self.skipped_blocks,
            rejected = self.rejected_blocks,
            "Synced up to slot"
        );

        Ok(())
    }

    async fn run_queue(&mut self, mode: SyncMode, highest_expected_slot: Slot) -> Result<(), SyncError> {
        let mut queue = BlocksQueue::new(
            BlocksQueueConfig {
                services: self.services.clone(),
                config: self.config.clone().with_mode(mode),
                highest_expected_slot,
                fetcher: None,
            },
            &self.cancellation,
        );
        queue.start()?;

        while let Some(data) = queue.next_batch().await {
            let start = data.start;
            if let Err(error) = self.process_fetched_data(data, highest_expected_slot).await {
                debug!(start = %start, %error, "Batch does not link to the chain");
                queue.reject_batch(start);
            }
        }

        if let Err(error) = queue.stop().await {
            warn!(%error, "Failed to stop blocks queue");
        }

        if self.cancellation.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    /// Blocks until enough peers with a usable finalized checkpoint are
    /// connected.
    async fn wait_for_minimum_peers(&self) -> Result<(), SyncError> {
        let required = self.config.required_peers();
        loop {
            let finalized_epoch = self.services.finalization.finalized_checkpoint().epoch;
            let (_, peers) = self
                .services
                .peers
                .best_finalized(self.config.max_peers_to_sync, finalized_epoch);

            if let Some(metrics) = self.services.metrics.as_deref() {
                metrics.set_peers(peers.len());
            }
            if peers.len() >= required {
                return Ok(());
            }

            info!(suitable = peers.len(), required, "Waiting for enough suitable peers");
            tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => return Err(SyncError::Cancelled),
                _ = tokio::time::sleep(HANDSHAKE_POLLING_INTERVAL) => {}
            }
        }
    }

    fn highest_finalized_slot(&self) -> Slot {
        let finalized_epoch = self.services.finalization.finalized_checkpoint().epoch;
        let (epoch, _) = self
            .services
            .peers
            .best_finalized(self.config.max_peers_to_sync, finalized_epoch);
        (epoch + 1).start_slot()
    }

    /// Applies one batch to the chain.
    ///
    /// Fails with `ParentDoesNotExist` when the batch does not attach to the
    /// local chain, meaning blocks below it are still missing.
    pub async fn process_fetched_data(
        &mut self,
        data: FetchedData,
        highest_expected_slot: Slot,
    ) -> Result<(), SyncError> {
        let head_before = self.services.chain.head_slot();
        let mut accepted = 0u64;
        let mut missing_parent = None;

        for block in data.blocks.iter() {
            match self.process_block(block).await {
                Ok(()) => {
                    accepted += 1;
                    self.processed_blocks += 1;
                    self.inc_blocks_processed("ok");
                }
                Err(error @ SyncError::BlockAlreadyProcessed(_)) => {
                    debug!(slot = %block.slot(), %error, "Skipping block");
                    self.skipped_blocks += 1;
                    self.inc_blocks_processed("skipped");
                }
                Err(SyncError::ParentDoesNotExist(parent_root)) => {
                    debug!(slot = %block.slot(), parent = %parent_root, "Skipping block with unknown parent");
                    missing_parent.get_or_insert(parent_root);
                    self.skipped_blocks += 1;
                    self.inc_blocks_processed("skipped");
                }
                Err(error) => {
                    warn!(slot = %block.slot(), %error, "Block rejected");
                    self.rejected_blocks += 1;
                    self.inc_blocks_processed("rejected");
                }
            }
        }

        if accepted == 0 {
            warn!(
                peer = ?data.peer_id,
                start = %data.start,
                first_slot = ?data.blocks.first().map(SignedBeaconBlock::slot),
                num_blocks = data.blocks.len(),
                "Range is not processed"
            );
        }

        let head_slot = self.services.chain.head_slot();
        if let Some(peer_id) = data.peer_id {
            self.credit_peer(&peer_id, head_slot.distance_from(head_before));
        }

        self.log_progress(head_slot, highest_expected_slot);

        match missing_parent {
            Some(parent_root) => Err(SyncError::ParentDoesNotExist(parent_root)),
            None => Ok(()),
        }
    }

    async fn process_block(&self, block: &SignedBeaconBlock) -> Result<(), SyncError> {
        let chain = &self.services.chain;
        let slot = block.slot();
        let root = block.root();

        let finalized_slot = self.services.finalization.finalized_checkpoint().epoch.start_slot();
        if slot <= finalized_slot || (slot <= chain.head_slot() && chain.has_block(&root)) {
            return Err(SyncError::BlockAlreadyProcessed(slot));
        }

        let parent_root = block.parent_root();
        if !chain.has_block(&parent_root) {
            return Err(SyncError::ParentDoesNotExist(parent_root));
        }

        chain
            .receive_block(block.clone(), root)
            .await
            .map_err(|error| SyncError::BlockRejected(format!("{error:#}")))
    }

    fn credit_peer(&self, peer_id: &PeerId, count: u64) {
        if count > 0 {
            self.services.peers.record_processed_blocks(peer_id, count);
        }
    }

    fn inc_blocks_processed(&self, result: &str) {
        if let Some(metrics) = self.services.metrics.as_deref() {
            metrics.inc_blocks_processed(result);
        }
    }

    fn log_progress(&self, head_slot: Slot, highest_expected_slot: Slot) {
        let elapsed = self
            .started
            .map_or(Duration::ZERO, |started| started.elapsed())
            .as_secs_f64();
        let rate = if elapsed > 0.0 { self.processed_blocks as f64 / elapsed } else { 0.0 };
        let remaining = highest_expected_slot.distance_from(head_slot);
        let eta = if rate > 0.0 {
            Duration::from_secs_f64(remaining as f64 / rate)
        } else {
            Duration::ZERO
        };

        info!(
            head_slot = %head_slot,
            highest_expected_slot = %highest_expected_slot,
            blocks_per_second = %format!("{rate:.1}"),
            eta = ?eta,
            "Processing blocks"
        );
    }

    fn transition(&mut self, target: SyncState) {
        if self.state == target {
            return;
        }
        if !self.state.can_transition_to(target) {
            warn!(from = ?self.state, to = ?target, "Invalid state transition attempted");
            return;
        }
        info!(from = ?self.state, to = ?target, "Sync state changed");
        self.state = target;
    }

    /// Get sync statistics.
    pub fn get_stats(&self) -> SyncStats {
        SyncStats {
            state: self.state,
            head_slot: self.services.chain.head_slot(),
            processed_blocks: self.processed_blocks,
            skipped_blocks: self.skipped_blocks,
            rejected_blocks: self.rejected_blocks,
            connected_peers: self.services.peers.connected().len(),
        }
    }
}

/// Statistics about an initial sync run.
#[derive(Debug, Clone, Copy)]
pub struct SyncStats {
    pub state: SyncState,
    pub head_slot: Slot,
    pub processed_blocks: u64,
    pub skipped_blocks: u64,
    pub rejected_blocks: u64,
    pub connected_peers: usize,
}

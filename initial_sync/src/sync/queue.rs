use super::config::{
    SyncConfig, SyncMode, MAX_PENDING_REQUESTS, MAX_RESET_ATTEMPTS, NO_REQUIRED_PEERS_ERR_MAX_RETRIES,
    QUEUE_STOP_CALL_TIMEOUT,
};
use super::error::SyncError;
use super::fetcher::{BlocksFetcher, FetchRequestParams, FetchRequestResponse};
use super::fetcher_utils::ForkData;
use super::state_machine::{QueueEvent, StateId, StateMachine, StateMachineManager};
use crate::types::SyncServices;
use containers::{Epoch, SignedBeaconBlock, Slot};
use libp2p_identity::PeerId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct BlocksQueueConfig {
    pub services: SyncServices,
    pub config: SyncConfig,
    pub highest_expected_slot: Slot,
    /// Fetcher to use; one is created from `services` when absent.
    pub fetcher: Option<Arc<BlocksFetcher>>,
}

/// Blocks ready to be handed to the chain, in slot order.
#[derive(Debug, Clone)]
pub struct FetchedData {
    /// Start slot of the range the blocks were fetched for.
    pub start: Slot,
    pub peer_id: Option<PeerId>,
    pub blocks: Arc<[SignedBeaconBlock]>,
}

#[derive(Debug)]
pub(crate) enum WindowReset {
    FromSlot(Slot),
    FromFork(ForkData),
}

/// Sliding window of range state machines ahead of the chain head.
///
/// A single coordinator task owns the window. Fetches run concurrently and
/// report back through a channel; batches leave through `fetched_data` in
/// ascending slot order. The consumer reports batches that do not attach
/// to its chain back through `reject_batch`.
pub struct BlocksQueue {
    cancellation: CancellationToken,
    runner: Option<QueueRunner>,
    fetched_data: mpsc::Receiver<FetchedData>,
    rejections: mpsc::Sender<Slot>,
    handle: Option<JoinHandle<()>>,
    stopped: bool,
}

impl BlocksQueue {
    pub fn new(config: BlocksQueueConfig, parent: &CancellationToken) -> Self {
        let cancellation = parent.child_token();
        let fetcher = config.fetcher.unwrap_or_else(|| {
            Arc::new(BlocksFetcher::new(
                config.services.clone(),
                config.config.clone(),
                cancellation.child_token(),
            ))
        });

        let (responses_tx, responses_rx) = mpsc::channel(MAX_PENDING_REQUESTS);
        let (fetched_data_tx, fetched_data) = mpsc::channel(1);
        let (rejections, rejections_rx) = mpsc::channel(MAX_PENDING_REQUESTS);

        let runner = QueueRunner {
            smm: StateMachineManager::new(),
            fetcher,
            services: config.services,
            config: config.config,
            highest_expected_slot: config.highest_expected_slot,
            cancellation: cancellation.clone(),
            responses_tx,
            responses_rx,
            fetched_data_tx,
            rejections_rx,
            stale_epochs: HashMap::new(),
            pending_reset: None,
            no_required_peers_errors: 0,
            last_head: Slot(0),
        };

        Self {
            cancellation,
            runner: Some(runner),
            fetched_data,
            rejections,
            handle: None,
            stopped: false,
        }
    }

    /// Spawns the coordinator task.
    pub fn start(&mut self) -> Result<(), SyncError> {
        if self.cancellation.is_cancelled() {
            return Err(SyncError::QueueCtxIsDone);
        }
        let Some(runner) = self.runner.take() else {
            return Err(SyncError::QueueCtxIsDone);
        };

        self.handle = Some(tokio::spawn(runner.run()));
        Ok(())
    }

    /// Cancels the queue and waits for the coordinator to exit.
    pub async fn stop(&mut self) -> Result<(), SyncError> {
        self.cancellation.cancel();
        // A never started runner still holds the data sender.
        self.runner = None;

        if self.stopped {
            return Ok(());
        }
        let Some(handle) = self.handle.take() else {
            return Err(SyncError::QueueTakesTooLongToStop);
        };

        match tokio::time::timeout(QUEUE_STOP_CALL_TIMEOUT, handle).await {
            Ok(result) => {
                if let Err(error) = result {
                    warn!(%error, "Blocks queue task ended abnormally");
                }
                self.stopped = true;
                Ok(())
            }
            Err(_) => Err(SyncError::QueueTakesTooLongToStop),
        }
    }

    /// Next batch of blocks; `None` once the queue has finished.
    pub async fn next_batch(&mut self) -> Option<FetchedData> {
        self.fetched_data.recv().await
    }

    /// Reports that the batch fetched for the range at `start` does not
    /// attach to the local chain. Ranges below it that peers answered with
    /// no blocks are fetched again.
    pub fn reject_batch(&self, start: Slot) {
        if let Err(error) = self.rejections.try_send(start) {
            debug!(start = %start, %error, "Can not report rejected batch");
        }
    }

    pub fn fetched_data(&mut self) -> &mut mpsc::Receiver<FetchedData> {
        &mut self.fetched_data
    }

    #[cfg(test)]
    pub(crate) fn runner_mut(&mut self) -> Option<&mut QueueRunner> {
        self.runner.as_mut()
    }
}

/// State owned by the coordinator task.
pub(crate) struct QueueRunner {
    pub(crate) smm: StateMachineManager,
    fetcher: Arc<BlocksFetcher>,
    services: SyncServices,
    config: SyncConfig,
    pub(crate) highest_expected_slot: Slot,
    cancellation: CancellationToken,
    responses_tx: mpsc::Sender<FetchRequestResponse>,
    responses_rx: mpsc::Receiver<FetchRequestResponse>,
    fetched_data_tx: mpsc::Sender<FetchedData>,
    rejections_rx: mpsc::Receiver<Slot>,
    stale_epochs: HashMap<Epoch, usize>,
    pub(crate) pending_reset: Option<WindowReset>,
    pub(crate) no_required_peers_errors: usize,
    last_head: Slot,
}

impl QueueRunner {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.polling_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.init_window();

        loop {
            if self.services.chain.head_slot() >= self.highest_expected_slot && !self.raise_highest_expected_slot() {
                debug!(
                    head_slot = %self.services.chain.head_slot(),
                    highest_expected_slot = %self.highest_expected_slot,
                    "Highest expected slot reached"
                );
                self.cancellation.cancel();
            }

            tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => {
                    debug!("Context closed, exiting blocks queue loop");
                    break;
                }
                Some(response) = self.responses_rx.recv() => self.on_fetch_response(response).await,
                Some(start) = self.rejections_rx.recv() => self.on_batch_rejected(start),
                _ = ticker.tick() => self.on_tick().await,
            }
        }

        self.shutdown();
    }

    fn init_window(&mut self) {
        let batch_size = self.config.batch_size;
        let start = self.services.chain.head_slot() + 1;
        self.last_head = self.services.chain.head_slot();
        // A window restored before start is kept as is.
        if self.smm.is_empty() {
            for step in 0..self.config.lookahead_steps as u64 {
                self.smm.add_state_machine(start + step * batch_size, batch_size);
            }
        }
        if let Some(metrics) = self.services.metrics.as_deref() {
            metrics.set_highest_expected_slot(self.highest_expected_slot.0);
        }
        debug!(machines = %self.smm, highest_expected_slot = %self.highest_expected_slot, "Blocks queue started");
    }

    /// Moves the ceiling up if peers now support more than it.
    fn raise_highest_expected_slot(&mut self) -> bool {
        let best = match self.config.mode {
            SyncMode::StopOnFinalizedEpoch => self.fetcher.best_finalized_slot(),
            SyncMode::NonConstrained => self.fetcher.best_non_finalized_slot(),
        };
        if best <= self.highest_expected_slot {
            return false;
        }

        debug!(from = %self.highest_expected_slot, to = %best, "Raising highest expected slot");
        self.highest_expected_slot = best;
        if let Some(metrics) = self.services.metrics.as_deref() {
            metrics.set_highest_expected_slot(best.0);
        }
        true
    }

    fn shutdown(mut self) {
        self.fetcher.stop();
        self.responses_rx.close();
        while self.responses_rx.try_recv().is_ok() {}
        debug!(machines = %self.smm, "Blocks queue stopped");
    }

    pub(crate) async fn on_tick(&mut self) {
        let head = self.services.chain.head_slot();
        if head > self.last_head {
            self.last_head = head;
            self.no_required_peers_errors = 0;
        }

        for key in self.smm.keys() {
            let Some(state) = self.smm.machine(key).map(StateMachine::state) else {
                continue;
            };

            let event = QueueEvent::for_tick(state);
            let event_name = event.name();
            match self.trigger(key, event).await {
                Ok(()) => {}
                Err(SyncError::NoRequiredPeers) => self.on_no_required_peers(),
                Err(error) => debug!(start = %key, event = event_name, %error, "Can not trigger event"),
            }

            self.collect_garbage(key);
        }

        if let Some(reset) = self.pending_reset.take() {
            self.apply_reset(reset).await;
        }

        self.report_metrics();
    }

    fn on_no_required_peers(&mut self) {
        self.no_required_peers_errors += 1;
        // Nothing ahead of us in head mode means we are done.
        if self.config.mode == SyncMode::NonConstrained
            || self.no_required_peers_errors > NO_REQUIRED_PEERS_ERR_MAX_RETRIES
        {
            info!(
                head_slot = %self.services.chain.head_slot(),
                "No peers with blocks beyond our head, stopping blocks queue"
            );
            self.cancellation.cancel();
        }
    }

    /// Drops a machine whose range the chain head has already passed and
    /// extends the window at the top.
    fn collect_garbage(&mut self, key: Slot) {
        let head = self.services.chain.head_slot();
        let Some(machine) = self.smm.machine(key) else {
            return;
        };
        if head < machine.end_slot() {
            return;
        }

        self.smm.remove_state_machine(key);
        if self.smm.len() < self.config.lookahead_steps {
            let start = self.smm.next_start().unwrap_or(head + 1);
            self.smm.add_state_machine(start, self.config.batch_size);
        }
    }

    /// The consumer could not attach the batch sent for `key`. Empty answers
    /// for lower ranges hid blocks, so those ranges are fetched again and
    /// the rejected range is retried after them.
    pub(crate) fn on_batch_rejected(&mut self, key: Slot) {
        let head = self.services.chain.head_slot();
        warn!(start = %key, head_slot = %head, "Batch does not attach to the chain, refetching lower ranges");

        if let Some(machine) = self.smm.machine_mut(key) {
            if machine.state() == StateId::Sent {
                machine.set_state(StateId::Skipped);
            }
        }

        for peer_id in self.reopen_ranges_below(key, head) {
            self.penalize_peer(&peer_id, key, "Peer is penalized for withholding blocks");
        }
    }

    /// Returns ranges below `key` the head has not passed to `New` when
    /// they were answered empty, or to `Skipped` when they were sent.
    /// Gives back the peers that served them.
    fn reopen_ranges_below(&mut self, key: Slot, head: Slot) -> Vec<PeerId> {
        let mut peers = Vec::new();
        for machine in self.smm.below_mut(key) {
            if machine.end_slot() <= head {
                continue;
            }

            let next = if machine.is_settled_empty() {
                StateId::New
            } else if machine.state() == StateId::Sent {
                StateId::Skipped
            } else {
                continue;
            };

            debug!(start = %machine.start, state = %machine.state(), "Refetching range");
            if let Some(peer_id) = machine.peer_id {
                peers.push(peer_id);
            }
            machine.set_state(next);
        }
        peers
    }

    fn penalize_peer(&self, peer_id: &PeerId, start: Slot, message: &'static str) {
        self.services.peers.penalize(peer_id);
        if let Some(metrics) = self.services.metrics.as_deref() {
            metrics.inc_peer_penalties();
        }
        warn!(peer = %peer_id, start = %start, "{message}");
    }

    async fn on_fetch_response(&mut self, response: FetchRequestResponse) {
        let key = response.start;
        if self.smm.machine(key).is_none() {
            debug!(start = %key, "No state machine for fetch response");
            return;
        }

        if let Err(error) = self.trigger(key, QueueEvent::DataReceived(response)).await {
            debug!(start = %key, %error, "Can not trigger event");
            if error.is_shutdown() {
                return;
            }
            // Failed fetches go back to the pool and are retried.
            if let Some(machine) = self.smm.machine_mut(key) {
                if machine.state() == StateId::Scheduled {
                    machine.set_state(StateId::New);
                }
            }
        }
    }

    /// Dispatches `event` to the handler for the machine's current state and
    /// applies the resulting transition.
    pub(crate) async fn trigger(&mut self, key: Slot, event: QueueEvent) -> Result<(), SyncError> {
        let Some(state) = self.smm.machine(key).map(StateMachine::state) else {
            return Ok(());
        };

        let next = match (state, event) {
            (StateId::New, QueueEvent::Schedule) => self.on_schedule_event(key)?,
            (StateId::Scheduled, QueueEvent::DataReceived(response)) => {
                self.on_data_received_event(key, response)?
            }
            (StateId::DataParsed, QueueEvent::ReadyToSend) => self.on_ready_to_send_event(key).await?,
            (StateId::Skipped, QueueEvent::ProcessSkipped) => self.on_process_skipped_event(key).await?,
            (StateId::Scheduled | StateId::Sent, QueueEvent::CheckStale) => self.on_check_stale_event(key)?,
            (state, event) => {
                debug!(start = %key, state = %state, event = event.name(), "Event not handled in state");
                return Ok(());
            }
        };

        if let Some(machine) = self.smm.machine_mut(key) {
            if machine.state() != next {
                machine.set_state(next);
            }
        }
        Ok(())
    }

    fn ensure_active(&self) -> Result<(), SyncError> {
        if self.cancellation.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    fn machine_in(&self, key: Slot, state: StateId) -> Result<&StateMachine, SyncError> {
        self.ensure_active()?;
        self.smm
            .machine(key)
            .filter(|machine| machine.state() == state)
            .ok_or(SyncError::InvalidInitialState)
    }

    pub(crate) fn on_schedule_event(&mut self, key: Slot) -> Result<StateId, SyncError> {
        let machine = self.machine_in(key, StateId::New)?;
        let params = FetchRequestParams { start: machine.start, count: machine.count };

        if params.start > self.highest_expected_slot {
            if let Some(machine) = self.smm.machine_mut(key) {
                machine.set_state(StateId::Skipped);
            }
            return Err(SyncError::SlotIsTooHigh);
        }

        self.fetcher.schedule_request(params, self.responses_tx.clone())?;
        Ok(StateId::Scheduled)
    }

    pub(crate) fn on_data_received_event(
        &mut self,
        key: Slot,
        response: FetchRequestResponse,
    ) -> Result<StateId, SyncError> {
        let machine = self.machine_in(key, StateId::Scheduled)?;
        if response.count != machine.count {
            debug!(start = %key, "Ignoring response for an outdated range");
            return Ok(StateId::Scheduled);
        }

        match response.result {
            Ok(blocks) => {
                if let Some(machine) = self.smm.machine_mut(key) {
                    machine.attach(response.peer_id, blocks);
                }
                Ok(StateId::DataParsed)
            }
            Err(SyncError::SlotIsTooHigh) => {
                // Current window is already too big, re-request previous epochs.
                for machine in self.smm.below_mut(key) {
                    if machine.state() == StateId::Skipped {
                        machine.set_state(StateId::New);
                    }
                }
                Err(SyncError::SlotIsTooHigh)
            }
            Err(SyncError::InvalidFetchedData) => {
                if let Some(peer_id) = response.peer_id {
                    self.penalize_peer(&peer_id, key, "Peer is penalized for invalid blocks");
                }
                Err(SyncError::InvalidFetchedData)
            }
            Err(error) => Err(error),
        }
    }

    pub(crate) async fn on_ready_to_send_event(&mut self, key: Slot) -> Result<StateId, SyncError> {
        let machine = self.machine_in(key, StateId::DataParsed)?;
        let Some(blocks) = machine.blocks().cloned() else {
            return Ok(StateId::Skipped);
        };
        if blocks.is_empty() {
            return Ok(StateId::Skipped);
        }

        // Blocks go out in order: every lower range must be delivered first,
        // unless this one continues right from the head.
        let head = self.services.chain.head_slot();
        if machine.start > head + 1 && !self.smm.below(key).all(StateMachine::is_delivered) {
            return Ok(StateId::DataParsed);
        }

        // Never hand out blocks the chain already has.
        let chain = &self.services.chain;
        let blocks: Arc<[SignedBeaconBlock]> = if blocks.first().is_some_and(|block| block.slot() <= head) {
            blocks
                .iter()
                .filter(|block| block.slot() > head || !chain.has_block(&block.root()))
                .cloned()
                .collect()
        } else {
            blocks
        };
        if blocks.is_empty() {
            return Ok(StateId::Sent);
        }

        let data = FetchedData { start: key, peer_id: machine.peer_id, blocks };
        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Err(SyncError::Cancelled),
            result = self.fetched_data_tx.send(data) => match result {
                Ok(()) => Ok(StateId::Sent),
                Err(_) => Err(SyncError::QueueCtxIsDone),
            },
        }
    }

    pub(crate) async fn on_process_skipped_event(&mut self, key: Slot) -> Result<StateId, SyncError> {
        let machine = self.machine_in(key, StateId::Skipped)?;
        let parked = machine.start > self.highest_expected_slot;
        let settled = machine.is_settled_empty();
        let is_highest = self.smm.highest().is_some_and(|highest| highest.start == key);

        // Failed ranges are retried; empty and out of bound ones stay put
        // unless the whole window is stuck.
        if !parked && !settled {
            return Ok(StateId::New);
        }
        if !is_highest {
            return Ok(StateId::Skipped);
        }

        // Everything below the ceiling went out and the chain took it.
        let head = self.services.chain.head_slot();
        let ceiling = self.highest_expected_slot;
        if self.smm.iter().any(|machine| machine.start > ceiling)
            && self.smm.iter().all(|machine| machine.is_delivered() || machine.start > ceiling)
            && !self.smm.iter().any(|machine| machine.awaits_import(head))
        {
            info!(head_slot = %head, highest_expected_slot = %ceiling, "No blocks left below the highest expected slot");
            self.cancellation.cancel();
            return Ok(StateId::Skipped);
        }

        if !self.smm.all_states_are(&[StateId::Skipped]) {
            return Ok(StateId::Skipped);
        }

        let best_slot = match self.config.mode {
            SyncMode::StopOnFinalizedEpoch => self.fetcher.best_finalized_slot(),
            SyncMode::NonConstrained => self.fetcher.best_non_finalized_slot(),
        };
        if best_slot <= head {
            return Err(SyncError::NoRequiredPeers);
        }

        let start = head + 1;
        if self.config.mode == SyncMode::NonConstrained && start > self.fetcher.best_finalized_slot() {
            let epoch = start.epoch();
            let attempts = self.stale_epochs.entry(epoch).or_default();
            *attempts += 1;

            // Repeatedly stuck at the same epoch: peers may be on another branch.
            if *attempts >= MAX_RESET_ATTEMPTS {
                self.stale_epochs.remove(&epoch);
                match self.fetcher.find_fork(start).await {
                    Ok(fork) => {
                        self.pending_reset = Some(WindowReset::FromFork(fork));
                        return Ok(StateId::Skipped);
                    }
                    Err(error) => debug!(start = %start, %error, "Can not find alternative blocks"),
                }
            }
        }

        self.pending_reset = Some(WindowReset::FromSlot(start));
        Ok(StateId::Skipped)
    }

    pub(crate) fn on_check_stale_event(&mut self, key: Slot) -> Result<StateId, SyncError> {
        self.ensure_active()?;
        let machine = self
            .smm
            .machine(key)
            .filter(|machine| matches!(machine.state(), StateId::Scheduled | StateId::Sent))
            .ok_or(SyncError::InvalidInitialState)?;

        if !machine.is_stale(self.config.stale_timeout) {
            return Ok(machine.state());
        }

        debug!(start = %key, state = %machine.state(), "Range is stale, skipping");
        let head = self.services.chain.head_slot();
        let awaits_import = machine.awaits_import(head);
        if awaits_import {
            // The chain never took these blocks, something below is missing.
            self.reopen_ranges_below(key, head);
        }
        Ok(StateId::Skipped)
    }

    async fn apply_reset(&mut self, reset: WindowReset) {
        let result = match reset {
            WindowReset::FromSlot(start) => self.reset_from_slot(start).await,
            WindowReset::FromFork(fork) => self.reset_from_fork(fork),
        };
        match result {
            Ok(()) => self.no_required_peers_errors = 0,
            Err(error) => debug!(%error, "Can not reset state machines"),
        }
    }

    /// Rebuilds the window from `start`. The last machine jumps ahead to the
    /// next slot known to hold a block, skipping long empty stretches.
    pub(crate) async fn reset_from_slot(&mut self, start: Slot) -> Result<(), SyncError> {
        let batch_size = self.config.batch_size;
        let steps = self.config.lookahead_steps.max(1) as u64;

        self.smm.remove_all_state_machines();
        for step in 0..steps - 1 {
            self.smm.add_state_machine(start + step * batch_size, batch_size);
        }

        let default_last = start + (steps - 1) * batch_size;
        let last = match self.fetcher.non_skipped_slot_after(default_last - 1).await {
            Ok(slot) if slot <= self.highest_expected_slot => slot,
            Ok(_) => default_last,
            Err(error) => {
                debug!(slot = %default_last, %error, "Can not find non-skipped slot");
                default_last
            }
        };
        self.smm.add_state_machine(last.max(default_last), batch_size);

        if let Some(metrics) = self.services.metrics.as_deref() {
            metrics.inc_queue_reset("slot");
        }
        debug!(start = %start, machines = %self.smm, "Reset state machines from slot");
        Ok(())
    }

    /// Rebuilds the window around blocks of an alternative branch. The
    /// first machine holds the fork blocks ready to be sent.
    pub(crate) fn reset_from_fork(&mut self, fork: ForkData) -> Result<(), SyncError> {
        let (Some(first), Some(last)) = (fork.blocks.first(), fork.blocks.last()) else {
            return Err(SyncError::NoPeersWithAltBlocks);
        };
        let first_slot = first.slot();
        let last_slot = last.slot();
        let batch_size = self.config.batch_size;

        self.smm.remove_all_state_machines();
        let machine = self
            .smm
            .add_state_machine(first_slot, last_slot.distance_from(first_slot) + 1);
        machine.attach(Some(fork.peer_id), fork.blocks.into());
        machine.set_state(StateId::DataParsed);

        let mut start = last_slot + 1;
        for _ in 1..self.config.lookahead_steps {
            self.smm.add_state_machine(start, batch_size);
            start += batch_size;
        }

        if let Some(metrics) = self.services.metrics.as_deref() {
            metrics.inc_queue_reset("fork");
        }
        info!(peer = %fork.peer_id, first_slot = %first_slot, last_slot = %last_slot, "Reset state machines from fork");
        Ok(())
    }

    fn report_metrics(&self) {
        let Some(metrics) = self.services.metrics.as_deref() else {
            return;
        };
        for state in StateId::ALL {
            metrics.set_state_machines(state.as_str(), self.smm.count_in(state));
        }
        metrics.set_head_slot(self.services.chain.head_slot().0);
    }
}

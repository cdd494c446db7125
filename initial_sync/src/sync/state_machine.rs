use super::fetcher::FetchRequestResponse;
use containers::{SignedBeaconBlock, Slot};
use libp2p_identity::PeerId;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Progress of a single slot range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateId {
    /// Waiting to be scheduled.
    New,
    /// Fetch request dispatched, waiting for the response.
    Scheduled,
    /// Blocks attached, waiting for every lower range to be delivered.
    DataParsed,
    /// Nothing to deliver: empty range, failure, or range beyond the ceiling.
    Skipped,
    /// Blocks handed to the consumer.
    Sent,
}

impl StateId {
    pub const ALL: [StateId; 5] = [
        StateId::New,
        StateId::Scheduled,
        StateId::DataParsed,
        StateId::Skipped,
        StateId::Sent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StateId::New => "new",
            StateId::Scheduled => "scheduled",
            StateId::DataParsed => "dataParsed",
            StateId::Skipped => "skipped",
            StateId::Sent => "sent",
        }
    }

    /// Check if a transition to the target state is valid.
    pub fn can_transition_to(&self, target: StateId) -> bool {
        if *self == target {
            return true;
        }
        match self {
            StateId::New => matches!(target, StateId::Scheduled | StateId::Skipped | StateId::DataParsed),
            StateId::Scheduled => matches!(target, StateId::DataParsed | StateId::Skipped | StateId::New),
            StateId::DataParsed => matches!(target, StateId::Sent | StateId::Skipped),
            StateId::Skipped => matches!(target, StateId::New),
            StateId::Sent => matches!(target, StateId::Skipped),
        }
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events driving range state machines.
#[derive(Debug)]
pub enum QueueEvent {
    Schedule,
    DataReceived(FetchRequestResponse),
    ReadyToSend,
    ProcessSkipped,
    CheckStale,
}

impl QueueEvent {
    pub fn name(&self) -> &'static str {
        match self {
            QueueEvent::Schedule => "schedule",
            QueueEvent::DataReceived(_) => "dataReceived",
            QueueEvent::ReadyToSend => "readyToSend",
            QueueEvent::ProcessSkipped => "processSkipped",
            QueueEvent::CheckStale => "checkStale",
        }
    }

    /// Event a tick delivers to a machine in `state`.
    pub fn for_tick(state: StateId) -> QueueEvent {
        match state {
            StateId::New => QueueEvent::Schedule,
            StateId::DataParsed => QueueEvent::ReadyToSend,
            StateId::Skipped => QueueEvent::ProcessSkipped,
            StateId::Scheduled | StateId::Sent => QueueEvent::CheckStale,
        }
    }
}

/// Tracks fetching and delivery of the range `[start, start + count)`.
#[derive(Debug, Clone)]
pub struct StateMachine {
    pub start: Slot,
    pub count: u64,
    state: StateId,
    pub peer_id: Option<PeerId>,
    blocks: Option<Arc<[SignedBeaconBlock]>>,
    updated: Instant,
}

impl StateMachine {
    pub fn new(start: Slot, count: u64) -> Self {
        Self {
            start,
            count,
            state: StateId::New,
            peer_id: None,
            blocks: None,
            updated: Instant::now(),
        }
    }

    pub fn state(&self) -> StateId {
        self.state
    }

    pub fn set_state(&mut self, state: StateId) {
        if !self.state.can_transition_to(state) {
            warn!(start = %self.start, from = %self.state, to = %state, "Unexpected state transition");
        }
        if state == StateId::New {
            self.peer_id = None;
            self.blocks = None;
        }
        self.state = state;
        self.updated = Instant::now();
    }

    /// Last slot covered by this machine.
    pub fn end_slot(&self) -> Slot {
        self.start + self.count.saturating_sub(1)
    }

    pub fn blocks(&self) -> Option<&Arc<[SignedBeaconBlock]>> {
        self.blocks.as_ref()
    }

    /// Attaches a fetch result. The previous blocks, if any, are replaced.
    pub fn attach(&mut self, peer_id: Option<PeerId>, blocks: Arc<[SignedBeaconBlock]>) {
        self.peer_id = peer_id;
        self.blocks = Some(blocks);
    }

    /// Skipped after a successful fetch that returned no blocks.
    pub fn is_settled_empty(&self) -> bool {
        self.state == StateId::Skipped && self.blocks.as_ref().is_some_and(|blocks| blocks.is_empty())
    }

    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.updated.elapsed() >= timeout
    }

    /// Whether this machine no longer holds back higher ranges.
    pub fn is_delivered(&self) -> bool {
        self.state == StateId::Sent || self.is_settled_empty()
    }

    /// Sent, but the chain has not imported the last block yet.
    pub fn awaits_import(&self, head: Slot) -> bool {
        self.state == StateId::Sent
            && self
                .blocks
                .as_ref()
                .and_then(|blocks| blocks.last())
                .is_some_and(|block| block.slot() > head)
    }

    #[cfg(test)]
    pub(crate) fn backdate(&mut self, by: Duration) {
        if let Some(updated) = self.updated.checked_sub(by) {
            self.updated = updated;
        }
    }
}

/// Ordered set of range state machines keyed by start slot.
#[derive(Debug, Default)]
pub struct StateMachineManager {
    machines: BTreeMap<Slot, StateMachine>,
}

impl StateMachineManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_state_machine(&mut self, start: Slot, count: u64) -> &mut StateMachine {
        let machine = StateMachine::new(start, count);
        match self.machines.entry(start) {
            Entry::Occupied(mut entry) => {
                entry.insert(machine);
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(machine),
        }
    }

    pub fn remove_state_machine(&mut self, start: Slot) -> Option<StateMachine> {
        self.machines.remove(&start)
    }

    pub fn remove_all_state_machines(&mut self) {
        self.machines.clear();
    }

    pub fn machine(&self, start: Slot) -> Option<&StateMachine> {
        self.machines.get(&start)
    }

    pub fn machine_mut(&mut self, start: Slot) -> Option<&mut StateMachine> {
        self.machines.get_mut(&start)
    }

    /// Start slots in ascending order.
    pub fn keys(&self) -> Vec<Slot> {
        self.machines.keys().copied().collect()
    }

    pub fn highest(&self) -> Option<&StateMachine> {
        self.machines.values().next_back()
    }

    /// First slot past the highest machine's range.
    pub fn next_start(&self) -> Option<Slot> {
        self.highest().map(|machine| machine.end_slot() + 1)
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    pub fn all_states_are(&self, states: &[StateId]) -> bool {
        self.machines.values().all(|machine| states.contains(&machine.state))
    }

    /// Machines covering ranges strictly below `start`.
    pub fn below(&self, start: Slot) -> impl Iterator<Item = &StateMachine> {
        self.machines.range(..start).map(|(_, machine)| machine)
    }

    pub fn below_mut(&mut self, start: Slot) -> impl Iterator<Item = &mut StateMachine> {
        self.machines.range_mut(..start).map(|(_, machine)| machine)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StateMachine> {
        self.machines.values()
    }

    pub fn count_in(&self, state: StateId) -> usize {
        self.machines.values().filter(|machine| machine.state == state).count()
    }
}

impl fmt::Display for StateMachineManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for machine in self.machines.values() {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            write!(f, "[{}..{}:{}]", machine.start, machine.end_slot(), machine.state)?;
        }
        Ok(())
    }
}

use super::config::MAX_BAD_RESPONSES;
use crate::types::{ConnectionState, PeerSet};
use containers::{Slot, Status};
use libp2p_identity::PeerId;
use parking_lot::RwLock;
/// Peer manager for sync operations.
///
/// Tracks peer chain status and block provider scores.
use std::collections::HashMap;

/// Sync-specific peer state.
///
/// Wraps peer information with sync-specific state: chain status and scoring.
#[derive(Debug, Clone)]
pub struct SyncPeer {
    pub peer_id: PeerId,
    pub connection_state: ConnectionState,
    pub status: Option<Status>,
    pub bad_responses: usize,
    pub processed_blocks: u64,
}

impl SyncPeer {
    pub fn new(peer_id: PeerId, connection_state: ConnectionState) -> Self {
        Self {
            peer_id,
            connection_state,
            status: None,
            bad_responses: 0,
            processed_blocks: 0,
        }
    }

    /// Check if peer is connected.
    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }

    /// Check if peer is connected and not banned for bad responses.
    pub fn is_usable(&self) -> bool {
        self.is_connected() && self.bad_responses < MAX_BAD_RESPONSES
    }

    /// Check if peer likely has data for given slot.
    pub fn has_slot(&self, slot: Slot) -> bool {
        self.status.is_some_and(|status| status.head_slot >= slot)
    }
}

/// In-memory peer set.
///
/// Thread-safe: sync tasks read chain states and report penalties
/// concurrently, so all access goes through an internal lock.
#[derive(Debug, Default)]
pub struct PeerManager {
    peers: RwLock<HashMap<PeerId, SyncPeer>>,
}

impl PeerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer to the manager. Existing entries are left untouched.
    pub fn add_peer(&self, peer_id: PeerId, connection_state: ConnectionState) {
        self.peers
            .write()
            .entry(peer_id)
            .or_insert_with(|| SyncPeer::new(peer_id, connection_state));
    }

    /// Remove a peer from the manager.
    pub fn remove_peer(&self, peer_id: &PeerId) -> Option<SyncPeer> {
        self.peers.write().remove(peer_id)
    }

    /// Get a snapshot of a peer by ID.
    pub fn get_peer(&self, peer_id: &PeerId) -> Option<SyncPeer> {
        self.peers.read().get(peer_id).cloned()
    }

    /// Update peer connection state.
    pub fn update_connection_state(&self, peer_id: &PeerId, state: ConnectionState) {
        if let Some(peer) = self.peers.write().get_mut(peer_id) {
            peer.connection_state = state;
        }
    }

    /// Update peer chain status.
    pub fn update_status(&self, peer_id: &PeerId, status: Status) {
        if let Some(peer) = self.peers.write().get_mut(peer_id) {
            peer.status = Some(status);
        }
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}

impl PeerSet for PeerManager {
    fn connected(&self) -> Vec<PeerId> {
        self.peers
            .read()
            .values()
            .filter(|peer| peer.is_usable())
            .map(|peer| peer.peer_id)
            .collect()
    }

    fn chain_state(&self, peer_id: &PeerId) -> Option<Status> {
        self.peers.read().get(peer_id).and_then(|peer| peer.status)
    }

    fn bad_responses(&self, peer_id: &PeerId) -> usize {
        self.peers
            .read()
            .get(peer_id)
            .map_or(0, |peer| peer.bad_responses)
    }

    fn penalize(&self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.write().get_mut(peer_id) {
            peer.bad_responses += 1;
        }
    }

    fn record_processed_blocks(&self, peer_id: &PeerId, count: u64) {
        if let Some(peer) = self.peers.write().get_mut(peer_id) {
            peer.processed_blocks += count;
        }
    }
}

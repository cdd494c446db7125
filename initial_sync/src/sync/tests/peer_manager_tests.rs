use crate::sync::config::MAX_BAD_RESPONSES;
use crate::sync::{PeerManager, SyncPeer};
use crate::types::{ConnectionState, PeerSet};
use containers::{Bytes32, Checkpoint, Epoch, Slot, Status};
use libp2p_identity::PeerId;

fn status(finalized_epoch: u64, head_slot: u64) -> Status {
    Status::new(
        Checkpoint::new(Epoch(finalized_epoch), Bytes32::default()),
        Bytes32::default(),
        Slot(head_slot),
    )
}

fn manager_with(statuses: &[(u64, u64)]) -> (PeerManager, Vec<PeerId>) {
    let manager = PeerManager::new();
    let peers = statuses
        .iter()
        .map(|(finalized_epoch, head_slot)| {
            let peer_id = PeerId::random();
            manager.add_peer(peer_id, ConnectionState::Connected);
            manager.update_status(&peer_id, status(*finalized_epoch, *head_slot));
            peer_id
        })
        .collect();
    (manager, peers)
}

#[test]
fn test_sync_peer_is_usable() {
    let mut peer = SyncPeer::new(PeerId::random(), ConnectionState::Connected);
    assert!(peer.is_usable());

    peer.bad_responses = MAX_BAD_RESPONSES;
    assert!(!peer.is_usable());

    peer.bad_responses = 0;
    peer.connection_state = ConnectionState::Disconnecting;
    assert!(!peer.is_usable());
}

#[test]
fn test_sync_peer_has_slot() {
    let mut peer = SyncPeer::new(PeerId::random(), ConnectionState::Connected);
    assert!(!peer.has_slot(Slot(1)));

    peer.status = Some(status(1, 100));
    assert!(peer.has_slot(Slot(100)));
    assert!(!peer.has_slot(Slot(101)));
}

#[test]
fn test_peer_manager_add_and_get() {
    let manager = PeerManager::new();
    let peer_id = PeerId::random();

    manager.add_peer(peer_id, ConnectionState::Connected);
    assert!(manager.get_peer(&peer_id).is_some());
    assert_eq!(manager.len(), 1);

    manager.remove_peer(&peer_id);
    assert!(manager.is_empty());
}

#[test]
fn test_peer_manager_update_status() {
    let (manager, peers) = manager_with(&[(3, 150)]);

    let peer = manager.get_peer(&peers[0]).unwrap();
    assert_eq!(peer.status.unwrap().finalized_epoch(), Epoch(3));
    assert_eq!(manager.chain_state(&peers[0]).unwrap().head_slot, Slot(150));
}

#[test]
fn test_connected_skips_disconnected_and_penalized_peers() {
    let (manager, peers) = manager_with(&[(1, 64), (1, 64), (1, 64)]);

    manager.update_connection_state(&peers[0], ConnectionState::Disconnected);
    for _ in 0..MAX_BAD_RESPONSES {
        manager.penalize(&peers[1]);
    }

    assert_eq!(manager.connected(), vec![peers[2]]);
    assert_eq!(manager.bad_responses(&peers[1]), MAX_BAD_RESPONSES);
}

#[test]
fn test_record_processed_blocks() {
    let (manager, peers) = manager_with(&[(1, 64)]);

    manager.record_processed_blocks(&peers[0], 10);
    manager.record_processed_blocks(&peers[0], 5);

    assert_eq!(manager.get_peer(&peers[0]).unwrap().processed_blocks, 15);
}

#[test]
fn test_best_finalized_picks_highest_epoch() {
    let (manager, peers) = manager_with(&[(3, 200), (5, 300), (5, 320), (2, 100)]);

    let (epoch, best) = manager.best_finalized(15, Epoch(0));

    assert_eq!(epoch, Epoch(5));
    assert_eq!(best.len(), 2);
    assert!(best.contains(&peers[1]));
    assert!(best.contains(&peers[2]));
}

#[test]
fn test_best_finalized_ignores_peers_behind_us() {
    let (manager, _) = manager_with(&[(3, 200), (4, 300)]);

    let (epoch, best) = manager.best_finalized(15, Epoch(5));

    assert_eq!(epoch, Epoch(0));
    assert!(best.is_empty());
}

#[test]
fn test_best_non_finalized_orders_by_head() {
    let (manager, peers) = manager_with(&[(1, 100), (1, 330), (1, 335), (1, 40)]);

    let (epoch, best) = manager.best_non_finalized(Epoch(2));

    assert_eq!(epoch, Epoch(10));
    assert_eq!(best, vec![peers[2], peers[1]]);
}

use super::common::{create_test_block, make_chain, test_config, up_to, TestEnv};
use crate::sync::{FetchedData, InitialSync, SyncError, SyncState};
use crate::types::{BlockConsumer, PeerSet};
use containers::{Bytes32, Slot};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[test]
fn test_sync_state_transitions() {
    assert!(SyncState::Idle.can_transition_to(SyncState::Syncing));
    assert!(SyncState::Idle.can_transition_to(SyncState::Synced));
    assert!(SyncState::Syncing.can_transition_to(SyncState::Synced));
    assert!(SyncState::Synced.can_transition_to(SyncState::Syncing));
    assert!(!SyncState::Syncing.can_transition_to(SyncState::Syncing));
    assert_eq!(SyncState::default(), SyncState::Idle);
}

#[tokio::test]
async fn test_genesis_is_synced_immediately() {
    let env = TestEnv::new(&make_chain(0, |_| true));
    let mut sync = InitialSync::new(env.services(), test_config(), CancellationToken::new());

    sync.run(Slot(0)).await.unwrap();

    assert_eq!(sync.state(), SyncState::Synced);
}

#[tokio::test]
async fn test_run_syncs_finalized_and_head() {
    let chain = make_chain(320, |slot| slot % 5 != 0);
    let env = TestEnv::new(&chain[..1]);
    let peers = [env.add_peer(chain.clone(), 6), env.add_peer(chain.clone(), 6)];

    let mut sync = InitialSync::new(env.services(), test_config(), CancellationToken::new());
    tokio::time::timeout(Duration::from_secs(30), sync.run(Slot(320)))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(sync.state(), SyncState::Synced);
    assert_eq!(env.chain.head_slot(), Slot(319));

    let stats = sync.get_stats();
    assert_eq!(stats.processed_blocks, chain.len() as u64 - 1);
    assert_eq!(stats.rejected_blocks, 0);
    assert_eq!(stats.connected_peers, 2);

    let credited: u64 = peers
        .iter()
        .map(|peer_id| env.peers.get_peer(peer_id).unwrap().processed_blocks)
        .sum();
    assert_eq!(credited, 319);
}

#[tokio::test]
async fn test_run_is_cancellable_while_waiting_for_peers() {
    let env = TestEnv::new(&make_chain(0, |_| true));
    let cancellation = CancellationToken::new();
    let mut sync = InitialSync::new(env.services(), test_config(), cancellation.clone());

    cancellation.cancel();

    assert_eq!(sync.run(Slot(100)).await, Err(SyncError::Cancelled));
    assert_eq!(sync.state(), SyncState::Syncing);
}

#[tokio::test]
async fn test_process_fetched_data_skips_known_and_orphan_blocks() {
    let chain = make_chain(20, |_| true);
    let env = TestEnv::new(&up_to(&chain, 10));
    let peer_id = env.add_peer(chain.clone(), 0);
    let mut sync = InitialSync::new(env.services(), test_config(), CancellationToken::new());

    let orphan = create_test_block(21, Bytes32::from([7; 32]), 0);
    let mut blocks = chain[5..].to_vec();
    blocks.push(orphan);

    let result = sync
        .process_fetched_data(
            FetchedData { start: Slot(1), peer_id: Some(peer_id), blocks: blocks.into() },
            Slot(21),
        )
        .await;

    assert_eq!(result, Err(SyncError::ParentDoesNotExist(Bytes32::from([7; 32]))));

    let stats = sync.get_stats();
    assert_eq!(stats.processed_blocks, 10);
    assert_eq!(stats.skipped_blocks, 7);
    assert_eq!(env.chain.head_slot(), Slot(20));
    assert_eq!(env.peers.get_peer(&peer_id).unwrap().processed_blocks, 10);
    assert_eq!(env.peers.bad_responses(&peer_id), 0);
}

#[tokio::test]
async fn test_process_fetched_data_skips_finalized_blocks() {
    let chain = make_chain(64, |_| true);
    let env = TestEnv::new(&chain[..1]);
    env.chain.set_finalized(1);
    let mut sync = InitialSync::new(env.services(), test_config(), CancellationToken::new());

    let data = FetchedData { start: Slot(1), peer_id: None, blocks: chain[1..=32].to_vec().into() };

    assert_eq!(sync.process_fetched_data(data, Slot(64)).await, Ok(()));

    let stats = sync.get_stats();
    assert_eq!(stats.processed_blocks, 0);
    assert_eq!(stats.skipped_blocks, 32);
}

#[tokio::test]
async fn test_run_recovers_from_withheld_range() {
    let chain = make_chain(320, |_| true);

    // Which peer serves the withheld range is random, so try a few times.
    for _ in 0..4 {
        let env = TestEnv::new(&chain[..1]);
        let withholding = env.add_peer(chain.clone(), 6);
        env.add_peer(chain.clone(), 6);
        env.network.withhold_range(&withholding, 65, 128);

        let mut sync = InitialSync::new(env.services(), test_config(), CancellationToken::new());
        tokio::time::timeout(Duration::from_secs(30), sync.run(Slot(320)))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(sync.state(), SyncState::Synced);
        assert_eq!(env.chain.head_slot(), Slot(320));
        assert_eq!(env.chain.received(), (1..=320).collect::<Vec<_>>());
    }
}

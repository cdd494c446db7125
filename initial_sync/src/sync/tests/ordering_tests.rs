use super::common::{make_chain, slots, test_config, TestEnv};
use crate::sync::{BlocksQueue, BlocksQueueConfig};
use crate::types::BlockConsumer;
use containers::Slot;
use proptest::prelude::*;
use std::collections::HashSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const HIGHEST_EXPECTED_SLOT: u64 = 192;

/// Syncs an empty node from one healthy peer plus one peer per failing
/// window. Returns the canonical slots and the slots the node received.
fn sync_chain(skipped: &HashSet<u64>, failing: &[(u64, u64)]) -> (Vec<u64>, Vec<u64>) {
    let chain = make_chain(320, |slot| !skipped.contains(&slot));
    let env = TestEnv::new(&chain[..1]);
    env.add_peer(chain.clone(), 6);
    for (from, len) in failing {
        let peer_id = env.add_peer(chain.clone(), 6);
        env.network.fail_range(&peer_id, *from, from + len);
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(async {
        let mut queue = BlocksQueue::new(
            BlocksQueueConfig {
                services: env.services(),
                config: test_config(),
                highest_expected_slot: Slot(HIGHEST_EXPECTED_SLOT),
                fetcher: None,
            },
            &CancellationToken::new(),
        );
        queue.start().unwrap();

        let consume = async {
            while let Some(data) = queue.next_batch().await {
                for block in data.blocks.iter() {
                    env.chain.receive_block(block.clone(), block.root()).await.unwrap();
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(20), consume)
            .await
            .expect("queue did not finish in time");
        queue.stop().await.unwrap();
    });

    (slots(&chain[1..]), env.chain.received())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn delivered_blocks_are_ordered_without_gaps(
        skipped in prop::collection::hash_set(1u64..320, 0..96),
        failing in prop::collection::vec((1u64..256, 0u64..96), 0..3),
    ) {
        let (canonical, received) = sync_chain(&skipped, &failing);

        prop_assert!(received.windows(2).all(|pair| pair[0] < pair[1]));

        let head = received.last().copied().unwrap_or_default();
        let expected = canonical.iter().copied().take_while(|slot| *slot <= head).collect::<Vec<_>>();
        prop_assert_eq!(&received, &expected);

        let last_expected = canonical
            .iter()
            .copied()
            .take_while(|slot| *slot <= HIGHEST_EXPECTED_SLOT)
            .last()
            .unwrap_or_default();
        prop_assert!(head >= last_expected);
    }
}

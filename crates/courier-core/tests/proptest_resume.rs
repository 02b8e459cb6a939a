mod common;

use common::{Harness, ScriptedPlatform};
use courier_core::controller::ControlCommand;
use courier_core::relay_config::ChannelRef;
use courier_core::storage::Checkpoint;
use proptest::prelude::*;
use std::collections::BTreeSet;

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .expect("test runtime")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// A resumed run forwards exactly the ordinals above the checkpoint.
    #[test]
    fn resume_forwards_only_newer_messages(
        ids in proptest::collection::btree_set(1i64..500, 0..40),
        last_id in proptest::option::of(0i64..500),
        count in 0u64..1_000_000,
    ) {
        let source: Vec<i64> = ids.into_iter().collect();
        let expected: Vec<i64> = source
            .iter()
            .copied()
            .filter(|id| last_id.is_none_or(|last| *id > last))
            .collect();

        let (forwarded, stored) = paused_runtime().block_on(async {
            let harness = Harness::spawn(
                ScriptedPlatform::with_source(source.clone()),
                Checkpoint { last_id, count },
            )
            .await;
            harness.run(ControlCommand::Start).await;
            harness.handle.wait_until_idle().await;
            (harness.platform.forwarded_ids(), harness.checkpoints.stored())
        });

        prop_assert_eq!(&forwarded, &expected);
        prop_assert_eq!(stored.count, count + expected.len() as u64);
        if let Some(newest) = expected.last() {
            prop_assert_eq!(stored.last_id, Some(*newest));
        } else {
            prop_assert_eq!(stored.last_id, last_id);
        }
    }

    /// Stopping a run at any point and starting again never duplicates or loses a message.
    #[test]
    fn interrupted_runs_cover_source_exactly_once(
        ids in proptest::collection::btree_set(1i64..5_000, 1..40),
        stops in proptest::collection::vec(1u64..10, 1..5),
    ) {
        let source: Vec<i64> = ids.into_iter().collect();
        let total = source.len() as u64;

        let (delivered, stored) = paused_runtime().block_on(async {
            let harness = Harness::spawn(
                ScriptedPlatform::with_source(source.clone()),
                Checkpoint::default(),
            )
            .await;

            for stop_after in stops {
                let goal = (harness.handle.snapshot().forwarded + stop_after).min(total);
                harness.run(ControlCommand::Start).await;
                harness
                    .handle
                    .wait_for_progress(|p| p.checkpoint.count >= goal)
                    .await;
                harness.run(ControlCommand::Stop).await;
                harness.handle.wait_until_idle().await;
            }
            harness.run(ControlCommand::Start).await;
            harness.handle.wait_until_idle().await;

            (harness.platform.forwarded_ids(), harness.checkpoints.stored())
        });

        let unique: BTreeSet<i64> = delivered.iter().copied().collect();
        prop_assert_eq!(unique.len(), delivered.len());
        prop_assert_eq!(&delivered, &source);
        prop_assert_eq!(stored.count, total);
        prop_assert_eq!(stored.last_id, source.last().copied());
    }

    /// The checkpoint ordinal never moves backwards.
    #[test]
    fn checkpoint_is_monotonic(ordinals in proptest::collection::vec(any::<i64>(), 1..100)) {
        let mut checkpoint = Checkpoint::default();
        let mut previous = None;
        for ordinal in ordinals {
            checkpoint.advance(ordinal);
            prop_assert!(checkpoint.last_id >= previous);
            previous = checkpoint.last_id;
        }
    }

    /// Parsing operator input never panics and is stable under re-parsing.
    #[test]
    fn channel_parse_is_idempotent(input in "\\PC*") {
        if let Some(channel) = ChannelRef::parse(&input) {
            let reparsed = ChannelRef::parse(&channel.to_string());
            prop_assert_eq!(reparsed, Some(channel));
        }
    }
}

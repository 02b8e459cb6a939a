mod common;

use common::{configured, pacing, source, target, Harness, ScriptedPlatform, OPERATOR, STRANGER};
use courier_core::controller::{
    ControlCommand, ControlOutcome, ControllerSettings, RunEnd, RunState,
};
use courier_core::error::ControlError;
use courier_core::governor::GovernorSettings;
use courier_core::platform::PlatformError;
use courier_core::relay_config::{ChannelRef, MissingChannel, OperatorId, RelayConfig};
use courier_core::storage::Checkpoint;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn resumes_after_stored_checkpoint() {
    let harness = Harness::spawn(
        ScriptedPlatform::with_source(95..=102),
        Checkpoint {
            last_id: Some(100),
            count: 40,
        },
    )
    .await;

    let outcome = harness.run(ControlCommand::Start).await;
    assert_eq!(
        outcome,
        ControlOutcome::Started {
            source: source(),
            target: target(),
            resume_after: Some(100),
        }
    );
    harness.handle.wait_until_idle().await;

    assert_eq!(harness.platform.forwarded_ids(), vec![101, 102]);
    assert_eq!(
        harness.checkpoints.stored(),
        Checkpoint {
            last_id: Some(102),
            count: 42,
        }
    );
    let status = harness.handle.snapshot();
    assert_eq!(status.forwarded, 42);
    assert_eq!(status.last_id, Some(102));
    assert_eq!(status.last_run, Some(RunEnd::Exhausted));
}

#[tokio::test(start_paused = true)]
async fn second_run_over_same_source_forwards_nothing() {
    let harness = Harness::spawn(ScriptedPlatform::with_source(1..=4), Checkpoint::default()).await;

    harness.run(ControlCommand::Start).await;
    assert_eq!(
        harness.run(ControlCommand::Start).await,
        ControlOutcome::AlreadyRunning(RunState::Running)
    );
    harness.handle.wait_until_idle().await;

    harness.run(ControlCommand::Start).await;
    harness.handle.wait_until_idle().await;

    assert_eq!(harness.platform.forwarded_ids(), vec![1, 2, 3, 4]);
    assert_eq!(harness.checkpoints.stored().count, 4);
}

#[tokio::test(start_paused = true)]
async fn stop_then_restart_keeps_order_without_duplicates() {
    let harness =
        Harness::spawn(ScriptedPlatform::with_source(1..=10), Checkpoint::default()).await;

    harness.run(ControlCommand::Start).await;
    harness
        .handle
        .wait_for_progress(|p| p.checkpoint.count >= 3)
        .await;
    assert_eq!(
        harness.run(ControlCommand::Stop).await,
        ControlOutcome::StopRequested
    );
    harness.handle.wait_until_idle().await;

    let after_stop = harness.platform.forwarded_ids();
    assert!(after_stop.len() < 10, "stop did not interrupt the run");
    assert_eq!(harness.checkpoints.stored().last_id, after_stop.last().copied());
    assert_eq!(
        harness.handle.snapshot().last_run,
        Some(RunEnd::Stopped)
    );

    harness.run(ControlCommand::Start).await;
    harness.handle.wait_until_idle().await;

    assert_eq!(harness.platform.forwarded_ids(), (1..=10).collect::<Vec<i64>>());
    assert_eq!(harness.checkpoints.stored().count, 10);
}

#[tokio::test(start_paused = true)]
async fn pause_holds_forwarding_until_resume() {
    let harness = Harness::spawn(ScriptedPlatform::with_source(1..=6), Checkpoint::default()).await;

    assert_eq!(
        harness.run(ControlCommand::Resume).await,
        ControlOutcome::NotRunning
    );
    harness.run(ControlCommand::Start).await;
    assert_eq!(
        harness.run(ControlCommand::Resume).await,
        ControlOutcome::NotPaused
    );
    harness
        .handle
        .wait_for_progress(|p| p.checkpoint.count >= 2)
        .await;

    assert_eq!(harness.run(ControlCommand::Pause).await, ControlOutcome::Paused);
    assert_eq!(
        harness.run(ControlCommand::Pause).await,
        ControlOutcome::AlreadyPaused
    );
    let held = harness.handle.snapshot().forwarded;

    tokio::time::sleep(Duration::from_secs(300)).await;
    let status = harness.handle.snapshot();
    assert_eq!(status.state, RunState::Paused);
    assert!(status.paused);
    assert_eq!(status.forwarded, held);

    assert_eq!(harness.run(ControlCommand::Resume).await, ControlOutcome::Resumed);
    harness.handle.wait_until_idle().await;
    assert_eq!(harness.platform.forwarded_ids(), (1..=6).collect::<Vec<i64>>());
}

#[tokio::test(start_paused = true)]
async fn stop_while_paused_ends_run() {
    let harness = Harness::spawn(ScriptedPlatform::with_source(1..=6), Checkpoint::default()).await;

    assert_eq!(
        harness.run(ControlCommand::Stop).await,
        ControlOutcome::NotRunning
    );
    harness.run(ControlCommand::Start).await;
    harness
        .handle
        .wait_for_progress(|p| p.checkpoint.count >= 1)
        .await;
    harness.run(ControlCommand::Pause).await;
    harness.run(ControlCommand::Stop).await;
    harness.handle.wait_until_idle().await;

    assert!(harness.platform.forwarded_ids().len() < 6);
    assert_eq!(harness.handle.state(), RunState::Idle);
    assert_eq!(
        harness.checkpoints.stored().count,
        harness.platform.forwarded_ids().len() as u64
    );
}

#[tokio::test(start_paused = true)]
async fn rate_limit_waits_then_retries_same_message() {
    let platform = ScriptedPlatform::with_source(1..=3).fail_once(
        2,
        PlatformError::RateLimited {
            wait: Duration::from_secs(30),
        },
    );
    let harness = Harness::spawn(platform, Checkpoint::default()).await;

    let started = Instant::now();
    harness.run(ControlCommand::Start).await;
    harness
        .handle
        .wait_for_progress(|p| p.flood_until.is_some())
        .await;
    assert_eq!(harness.handle.snapshot().forwarded, 1);
    assert_eq!(
        harness.checkpoints.stored(),
        Checkpoint {
            last_id: Some(1),
            count: 1,
        }
    );

    harness.handle.wait_until_idle().await;

    assert!(started.elapsed() >= Duration::from_secs(31));
    assert_eq!(harness.platform.forwarded_ids(), vec![1, 2, 3]);
    assert_eq!(harness.platform.attempts.load(Ordering::SeqCst), 4);
    assert_eq!(harness.handle.snapshot().skipped, 0);
}

#[tokio::test(start_paused = true)]
async fn failed_forward_is_skipped_after_error_pause() {
    let platform = ScriptedPlatform::with_source(1..=3)
        .fail_once(2, PlatformError::Rejected("message deleted".to_string()));
    let harness = Harness::spawn(platform, Checkpoint::default()).await;

    harness.run(ControlCommand::Start).await;
    harness.handle.wait_until_idle().await;

    assert_eq!(harness.platform.forwarded_ids(), vec![1, 3]);
    let status = harness.handle.snapshot();
    assert_eq!(status.forwarded, 2);
    assert_eq!(status.last_id, Some(3));
    assert_eq!(status.skipped, 1);
}

#[tokio::test(start_paused = true)]
async fn long_gap_of_failed_forwards_does_not_stop_the_run() {
    let platform = (1..=30).fold(ScriptedPlatform::with_source(1..=31), |platform, id| {
        platform.fail_once(
            id,
            PlatformError::Rejected("message to forward not found".to_string()),
        )
    });
    let harness = Harness::spawn(platform, Checkpoint::default()).await;

    harness.run(ControlCommand::Start).await;
    harness.handle.wait_until_idle().await;

    assert_eq!(harness.platform.forwarded_ids(), vec![31]);
    assert_eq!(harness.platform.attempts.load(Ordering::SeqCst), 31);
    let status = harness.handle.snapshot();
    assert_eq!(status.last_run, Some(RunEnd::Exhausted));
    assert_eq!(status.skipped, 30);
    assert_eq!(
        harness.checkpoints.stored(),
        Checkpoint {
            last_id: Some(31),
            count: 1,
        }
    );

    harness.run(ControlCommand::Start).await;
    harness.handle.wait_until_idle().await;
    assert_eq!(harness.platform.attempts.load(Ordering::SeqCst), 31);
    assert_eq!(harness.handle.snapshot().last_run, Some(RunEnd::Exhausted));
}

#[tokio::test(start_paused = true)]
async fn back_to_back_runs_each_count_as_finished() {
    let harness = Harness::spawn(ScriptedPlatform::with_source(1..=2), Checkpoint::default()).await;
    let mut progress = harness.handle.subscribe_progress();
    assert_eq!(progress.borrow_and_update().finished_runs, 0);

    harness.run(ControlCommand::Start).await;
    harness.handle.wait_until_idle().await;
    harness.run(ControlCommand::Start).await;
    harness.handle.wait_until_idle().await;

    let latest = progress.borrow_and_update().clone();
    assert_eq!(latest.finished_runs, 2);
    assert_eq!(latest.last_end, Some(RunEnd::Exhausted));
    assert_eq!(harness.platform.forwarded_ids(), vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn batch_rest_is_taken_between_batches() {
    let harness = Harness::spawn_with(
        ScriptedPlatform::with_source(1..=5),
        Checkpoint::default(),
        configured(),
        GovernorSettings {
            batch_size: 2,
            batch_rest: Duration::from_secs(600),
            ..pacing()
        },
        ControllerSettings::default(),
    )
    .await;

    let started = Instant::now();
    harness.run(ControlCommand::Start).await;
    harness
        .handle
        .wait_for_progress(|p| p.resting_until.is_some())
        .await;
    assert_eq!(harness.handle.snapshot().forwarded, 2);
    assert_eq!(harness.checkpoints.stored().count, 2);

    harness.handle.wait_until_idle().await;
    assert!(started.elapsed() >= Duration::from_secs(1200));
    assert_eq!(harness.platform.forwarded_ids(), (1..=5).collect::<Vec<i64>>());
}

#[tokio::test(start_paused = true)]
async fn strangers_cannot_control_the_relay() {
    let harness = Harness::spawn(ScriptedPlatform::with_source(1..=3), Checkpoint::default()).await;

    for command in [
        ControlCommand::Start,
        ControlCommand::Status,
        ControlCommand::RemoveSource,
        ControlCommand::ShowConfig,
    ] {
        let result = harness.handle.execute(STRANGER, command).await;
        assert!(matches!(result, Err(ControlError::Unauthorized(STRANGER))));
    }

    assert!(harness.handle.authorize(STRANGER).is_err());
    assert!(harness.handle.authorize(OPERATOR).is_ok());
    assert_eq!(harness.handle.state(), RunState::Idle);
    assert_eq!(harness.configs.stored(), configured());
    assert!(harness.platform.forwarded_ids().is_empty());
}

#[tokio::test(start_paused = true)]
async fn without_operator_everyone_is_refused_unless_open() {
    let config = RelayConfig {
        admin: None,
        ..configured()
    };

    let closed = Harness::spawn_with(
        ScriptedPlatform::with_source(1..=1),
        Checkpoint::default(),
        config.clone(),
        pacing(),
        ControllerSettings::default(),
    )
    .await;
    let result = closed.handle.execute(STRANGER, ControlCommand::Status).await;
    assert!(matches!(result, Err(ControlError::Unauthorized(_))));

    let open = Harness::spawn_with(
        ScriptedPlatform::with_source(1..=1),
        Checkpoint::default(),
        config,
        pacing(),
        ControllerSettings {
            allow_open_control: true,
            ..ControllerSettings::default()
        },
    )
    .await;
    let outcome = open
        .handle
        .execute(STRANGER, ControlCommand::Status)
        .await
        .expect("open control accepts anyone");
    assert!(matches!(outcome, ControlOutcome::Status(_)));
}

#[tokio::test(start_paused = true)]
async fn config_change_applies_to_next_run_only() {
    let harness =
        Harness::spawn(ScriptedPlatform::with_source(1..=5), Checkpoint::default()).await;

    harness.run(ControlCommand::Start).await;
    harness
        .handle
        .wait_for_progress(|p| p.checkpoint.count >= 1)
        .await;

    let elsewhere = ChannelRef::Handle("@elsewhere".to_string());
    let outcome = harness
        .run(ControlCommand::SetTarget(elsewhere.clone()))
        .await;
    let ControlOutcome::ConfigUpdated(updated) = outcome else {
        panic!("unexpected outcome: {outcome:?}");
    };
    assert_eq!(updated.target, Some(elsewhere.clone()));
    assert_eq!(harness.configs.stored().target, Some(elsewhere));

    harness.handle.wait_until_idle().await;
    assert!(harness.platform.targets().iter().all(|t| *t == target()));
    assert_eq!(harness.platform.forwarded_ids().len(), 5);
}

#[tokio::test]
async fn start_requires_both_channels() {
    let harness = Harness::spawn_with(
        ScriptedPlatform::with_source(1..=3),
        Checkpoint::default(),
        RelayConfig {
            admin: Some(OperatorId::new(OPERATOR)),
            ..RelayConfig::default()
        },
        pacing(),
        ControllerSettings::default(),
    )
    .await;

    let result = harness.handle.execute(OPERATOR, ControlCommand::Start).await;
    assert!(matches!(
        result,
        Err(ControlError::NotConfigured(MissingChannel::Both))
    ));

    harness
        .run(ControlCommand::SetSource(source()))
        .await;
    let result = harness.handle.execute(OPERATOR, ControlCommand::Start).await;
    assert!(matches!(
        result,
        Err(ControlError::NotConfigured(MissingChannel::Target))
    ));

    harness.run(ControlCommand::RemoveSource).await;
    let ControlOutcome::Config(config) = harness.run(ControlCommand::ShowConfig).await else {
        panic!("show_config should report the config");
    };
    assert_eq!(config.source, None);
    assert_eq!(harness.handle.state(), RunState::Idle);
}

#[tokio::test(start_paused = true)]
async fn shutdown_persists_progress() {
    let harness =
        Harness::spawn(ScriptedPlatform::with_source(1..=20), Checkpoint::default()).await;

    harness.run(ControlCommand::Start).await;
    harness
        .handle
        .wait_for_progress(|p| p.checkpoint.count >= 3)
        .await;
    harness.handle.shutdown().await;

    let stored = harness.checkpoints.stored();
    assert!(stored.count >= 3);
    assert_eq!(stored.last_id, harness.platform.forwarded_ids().last().copied());
    assert!(harness.checkpoints.saves.load(Ordering::SeqCst) >= 1);

    let result = harness.handle.execute(OPERATOR, ControlCommand::Status).await;
    assert!(matches!(result, Err(ControlError::Unavailable)));
}

//! In-memory platform and stores shared by the controller tests.
#![allow(dead_code)]

use async_trait::async_trait;
use courier_core::controller::{
    ControlCommand, ControlOutcome, ControllerHandle, ControllerSettings, ForwardingController,
};
use courier_core::governor::{GovernorSettings, RateGovernor};
use courier_core::platform::{MessageStream, PlatformError, RelayPlatform, SourceMessage};
use courier_core::relay_config::{ChannelRef, OperatorId, RelayConfig};
use courier_core::storage::{Checkpoint, CheckpointStore, RelayConfigStore, StorageError};
use futures_util::{stream, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Route controller logs through the test harness; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub const OPERATOR: i64 = 1001;
pub const STRANGER: i64 = 2002;

/// Source channel served from a fixed list, with per-message scripted failures.
#[derive(Default)]
pub struct ScriptedPlatform {
    pub source: Vec<i64>,
    pub failures: Mutex<HashMap<i64, VecDeque<PlatformError>>>,
    pub forwarded: Mutex<Vec<(ChannelRef, i64)>>,
    pub attempts: AtomicUsize,
}

impl ScriptedPlatform {
    pub fn with_source(ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            source: ids.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn fail_once(self, id: i64, error: PlatformError) -> Self {
        self.failures
            .lock()
            .expect("failures lock")
            .entry(id)
            .or_default()
            .push_back(error);
        self
    }

    pub fn forwarded_ids(&self) -> Vec<i64> {
        self.forwarded
            .lock()
            .expect("forwarded lock")
            .iter()
            .map(|(_, id)| *id)
            .collect()
    }

    pub fn targets(&self) -> Vec<ChannelRef> {
        self.forwarded
            .lock()
            .expect("forwarded lock")
            .iter()
            .map(|(target, _)| target.clone())
            .collect()
    }
}

#[async_trait]
impl RelayPlatform for ScriptedPlatform {
    async fn messages(
        &self,
        _source: &ChannelRef,
        _after: Option<i64>,
    ) -> Result<MessageStream, PlatformError> {
        let messages: Vec<_> = self
            .source
            .iter()
            .map(|&id| Ok(SourceMessage { id }))
            .collect();
        Ok(stream::iter(messages).boxed())
    }

    async fn forward(
        &self,
        _source: &ChannelRef,
        target: &ChannelRef,
        message: SourceMessage,
    ) -> Result<(), PlatformError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .failures
            .lock()
            .expect("failures lock")
            .get_mut(&message.id)
            .and_then(VecDeque::pop_front);
        if let Some(error) = scripted {
            return Err(error);
        }
        self.forwarded
            .lock()
            .expect("forwarded lock")
            .push((target.clone(), message.id));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCheckpoints {
    current: Mutex<Checkpoint>,
    pub saves: AtomicUsize,
}

impl MemoryCheckpoints {
    pub fn starting_at(checkpoint: Checkpoint) -> Self {
        Self {
            current: Mutex::new(checkpoint),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn stored(&self) -> Checkpoint {
        *self.current.lock().expect("checkpoint lock")
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpoints {
    async fn load(&self) -> Checkpoint {
        self.stored()
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        *self.current.lock().expect("checkpoint lock") = *checkpoint;
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryConfigs {
    current: Mutex<RelayConfig>,
}

impl MemoryConfigs {
    pub fn holding(config: RelayConfig) -> Self {
        Self {
            current: Mutex::new(config),
        }
    }

    pub fn stored(&self) -> RelayConfig {
        self.current.lock().expect("config lock").clone()
    }
}

#[async_trait]
impl RelayConfigStore for MemoryConfigs {
    async fn load(&self) -> RelayConfig {
        self.stored()
    }

    async fn save(&self, config: &RelayConfig) -> Result<(), StorageError> {
        *self.current.lock().expect("config lock") = config.clone();
        Ok(())
    }
}

pub fn source() -> ChannelRef {
    ChannelRef::Handle("@origin".to_string())
}

pub fn target() -> ChannelRef {
    ChannelRef::Id(-100_555)
}

pub fn configured() -> RelayConfig {
    RelayConfig {
        source: Some(source()),
        target: Some(target()),
        admin: Some(OperatorId::new(OPERATOR)),
    }
}

pub fn pacing() -> GovernorSettings {
    GovernorSettings {
        forward_delay: Duration::from_secs(1),
        batch_size: 0,
        batch_rest: Duration::from_secs(600),
        flood_margin: Duration::from_secs(1),
        error_pause: Duration::from_secs(2),
    }
}

pub struct Harness {
    pub handle: ControllerHandle,
    pub platform: Arc<ScriptedPlatform>,
    pub checkpoints: Arc<MemoryCheckpoints>,
    pub configs: Arc<MemoryConfigs>,
}

impl Harness {
    pub async fn spawn(platform: ScriptedPlatform, checkpoint: Checkpoint) -> Self {
        Self::spawn_with(
            platform,
            checkpoint,
            configured(),
            pacing(),
            ControllerSettings::default(),
        )
        .await
    }

    pub async fn spawn_with(
        platform: ScriptedPlatform,
        checkpoint: Checkpoint,
        config: RelayConfig,
        pacing: GovernorSettings,
        settings: ControllerSettings,
    ) -> Self {
        init_tracing();
        let platform = Arc::new(platform);
        let checkpoints = Arc::new(MemoryCheckpoints::starting_at(checkpoint));
        let configs = Arc::new(MemoryConfigs::holding(config));
        let handle = ForwardingController::spawn(
            platform.clone(),
            checkpoints.clone(),
            configs.clone(),
            RateGovernor::new(pacing),
            settings,
        )
        .await;
        Self {
            handle,
            platform,
            checkpoints,
            configs,
        }
    }

    pub async fn run(&self, command: ControlCommand) -> ControlOutcome {
        self.handle
            .execute(OPERATOR, command)
            .await
            .expect("operator command should be accepted")
    }
}


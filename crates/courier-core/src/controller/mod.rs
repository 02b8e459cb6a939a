//! Forwarding controller.
//!
//! A single task owns the relay state machine (`Idle → Running ⇄ Paused →
//! Stopping → Idle`). Control commands reach it as messages through a
//! [`ControllerHandle`]; the relay loop runs as a separate task and is driven
//! through a `watch` channel of directives. The loop reports progress back on
//! another `watch` channel, which status and health reads consume.

mod relay;
mod status;

pub use status::{Progress, RunEnd, RunState, StatusSnapshot};

use crate::auth::authorize;
use crate::error::ControlError;
use crate::governor::RateGovernor;
use crate::platform::RelayPlatform;
use crate::relay_config::{ChannelRef, OperatorId, RelayConfig};
use crate::storage::{Checkpoint, CheckpointStore, RelayConfigStore};
use chrono::Utc;
use relay::{Directive, RelayRun, RunReport};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// Capacity of the control command queue
pub const COMMAND_QUEUE_SIZE: usize = 32;

/// Controller behaviour that is fixed at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    /// Forwards between checkpoint writes
    pub checkpoint_every: u32,
    /// Let anyone control the relay while no operator is configured
    pub allow_open_control: bool,
    /// Operator to record when the stored config has none
    pub default_operator: Option<OperatorId>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            checkpoint_every: 50,
            allow_open_control: false,
            default_operator: None,
        }
    }
}

/// Operations the control surface can request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Start relaying from the checkpoint
    Start,
    /// Park the relay before its next forward
    Pause,
    /// Continue a paused relay
    Resume,
    /// End the active run
    Stop,
    /// Report state and counters
    Status,
    /// Change the source channel (applies to the next run)
    SetSource(ChannelRef),
    /// Change the target channel (applies to the next run)
    SetTarget(ChannelRef),
    /// Clear the source channel
    RemoveSource,
    /// Clear the target channel
    RemoveTarget,
    /// Report the stored configuration
    ShowConfig,
}

/// Result of an accepted control command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    /// A new run was spawned
    Started {
        /// Channel being read
        source: ChannelRef,
        /// Channel being written
        target: ChannelRef,
        /// Ordinal the run resumes after
        resume_after: Option<i64>,
    },
    /// A run is already active; nothing changed
    AlreadyRunning(RunState),
    /// The previous run is still winding down
    StillStopping,
    /// The relay will park before its next forward
    Paused,
    /// The relay was already paused
    AlreadyPaused,
    /// A paused relay continues
    Resumed,
    /// Resume was requested while not paused
    NotPaused,
    /// The active run will end before its next forward
    StopRequested,
    /// No run is active
    NotRunning,
    /// Current status
    Status(StatusSnapshot),
    /// Configuration after a successful change
    ConfigUpdated(RelayConfig),
    /// Stored configuration
    Config(RelayConfig),
}

type ControlReply = oneshot::Sender<Result<ControlOutcome, ControlError>>;

enum ControlRequest {
    Control {
        caller: i64,
        command: ControlCommand,
        reply: ControlReply,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Cloneable front door to the forwarding controller
#[derive(Clone)]
pub struct ControllerHandle {
    requests: mpsc::Sender<ControlRequest>,
    state: watch::Receiver<RunState>,
    config: watch::Receiver<RelayConfig>,
    progress: watch::Receiver<Progress>,
    allow_open_control: bool,
}

impl ControllerHandle {
    /// Run a control command on behalf of `caller`.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Unauthorized`] for anyone but the operator,
    /// [`ControlError::NotConfigured`] when starting without both channels,
    /// [`ControlError::Storage`] when a config change cannot be saved, and
    /// [`ControlError::Unavailable`] when the controller has shut down.
    pub async fn execute(
        &self,
        caller: i64,
        command: ControlCommand,
    ) -> Result<ControlOutcome, ControlError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(ControlRequest::Control {
                caller,
                command,
                reply,
            })
            .await
            .map_err(|_| ControlError::Unavailable)?;
        response.await.map_err(|_| ControlError::Unavailable)?
    }

    /// Stop any active run, persist the checkpoint and end the controller.
    pub async fn shutdown(&self) {
        let (done, finished) = oneshot::channel();
        if self.requests.send(ControlRequest::Shutdown { done }).await.is_ok() {
            let _ = finished.await;
        }
    }

    /// Check whether `caller` may control the relay, without issuing a command.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Unauthorized`] when the caller is refused.
    pub fn authorize(&self, caller: i64) -> Result<(), ControlError> {
        authorize(&self.config.borrow(), self.allow_open_control, caller)
    }

    /// Current controller state.
    #[must_use]
    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Current relay configuration.
    #[must_use]
    pub fn config(&self) -> RelayConfig {
        self.config.borrow().clone()
    }

    /// Status as seen right now. Needs no authorization; used by health checks.
    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        let state = self.state();
        let config = self.config.borrow().clone();
        let progress = self.progress.borrow().clone();
        StatusSnapshot::compose(state, &config, &progress, Utc::now())
    }

    /// Watch loop progress, including run ends (`Progress::finished_runs`).
    #[must_use]
    pub fn subscribe_progress(&self) -> watch::Receiver<Progress> {
        self.progress.clone()
    }

    /// Wait until no run is active.
    pub async fn wait_until_idle(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == RunState::Idle).await;
    }

    /// Wait until the published progress satisfies `condition`.
    pub async fn wait_for_progress(&self, condition: impl FnMut(&Progress) -> bool) {
        let mut progress = self.progress.clone();
        let _ = progress.wait_for(condition).await;
    }
}

/// Owner of the relay state machine
pub struct ForwardingController {
    platform: Arc<dyn RelayPlatform>,
    checkpoints: Arc<dyn CheckpointStore>,
    configs: Arc<dyn RelayConfigStore>,
    governor: RateGovernor,
    settings: ControllerSettings,
    config: RelayConfig,
    checkpoint: Checkpoint,
    state: watch::Sender<RunState>,
    config_tx: watch::Sender<RelayConfig>,
    progress: Arc<watch::Sender<Progress>>,
    directives: Option<watch::Sender<Directive>>,
    runs: JoinSet<RunReport>,
    requests: mpsc::Receiver<ControlRequest>,
}

impl ForwardingController {
    /// Load persisted state, spawn the controller task and return its handle.
    ///
    /// The controller always starts `Idle`; a stored checkpoint only decides
    /// where the next `start` resumes.
    pub async fn spawn(
        platform: Arc<dyn RelayPlatform>,
        checkpoints: Arc<dyn CheckpointStore>,
        configs: Arc<dyn RelayConfigStore>,
        governor: RateGovernor,
        settings: ControllerSettings,
    ) -> ControllerHandle {
        let checkpoint = checkpoints.load().await;
        let mut config = configs.load().await;
        seed_operator(&mut config, &settings, configs.as_ref()).await;

        info!(
            last_id = ?checkpoint.last_id,
            count = checkpoint.count,
            source = ?config.source,
            target = ?config.target,
            "Forwarding controller loaded"
        );

        let (requests_tx, requests) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let (state, state_rx) = watch::channel(RunState::Idle);
        let (config_tx, config_rx) = watch::channel(config.clone());
        let (progress, progress_rx) = watch::channel(Progress {
            checkpoint,
            ..Progress::default()
        });

        let controller = Self {
            platform,
            checkpoints,
            configs,
            governor,
            settings,
            config,
            checkpoint,
            state,
            config_tx,
            progress: Arc::new(progress),
            directives: None,
            runs: JoinSet::new(),
            requests,
        };
        tokio::spawn(controller.run());

        ControllerHandle {
            requests: requests_tx,
            state: state_rx,
            config: config_rx,
            progress: progress_rx,
            allow_open_control: settings.allow_open_control,
        }
    }

    async fn run(mut self) {
        debug!("Forwarding controller started");
        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(ControlRequest::Control { caller, command, reply }) => {
                        let result = self.handle(caller, command).await;
                        if reply.send(result).is_err() {
                            debug!("Control caller went away before the reply");
                        }
                    }
                    Some(ControlRequest::Shutdown { done }) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        return;
                    }
                    None => break,
                },
                Some(joined) = self.runs.join_next() => self.finish_run(joined).await,
            }
        }
        self.shutdown().await;
    }

    async fn handle(
        &mut self,
        caller: i64,
        command: ControlCommand,
    ) -> Result<ControlOutcome, ControlError> {
        if let Err(e) = authorize(&self.config, self.settings.allow_open_control, caller) {
            warn!(caller, ?command, "Refused control command");
            return Err(e);
        }
        debug!(caller, ?command, "Control command");

        match command {
            ControlCommand::Start => self.start(),
            ControlCommand::Pause => Ok(self.pause()),
            ControlCommand::Resume => Ok(self.resume()),
            ControlCommand::Stop => Ok(self.stop()),
            ControlCommand::Status => Ok(ControlOutcome::Status(self.snapshot())),
            ControlCommand::SetSource(source) => {
                self.update_config(|config| config.source = Some(source))
                    .await
            }
            ControlCommand::SetTarget(target) => {
                self.update_config(|config| config.target = Some(target))
                    .await
            }
            ControlCommand::RemoveSource => self.update_config(|config| config.source = None).await,
            ControlCommand::RemoveTarget => self.update_config(|config| config.target = None).await,
            ControlCommand::ShowConfig => Ok(ControlOutcome::Config(self.config.clone())),
        }
    }

    fn start(&mut self) -> Result<ControlOutcome, ControlError> {
        match self.current_state() {
            state @ (RunState::Running | RunState::Paused) => {
                return Ok(ControlOutcome::AlreadyRunning(state))
            }
            RunState::Stopping => return Ok(ControlOutcome::StillStopping),
            RunState::Idle => {}
        }

        let (source, target) = self
            .config
            .channels()
            .map_err(ControlError::NotConfigured)?;

        let (directives, directives_rx) = watch::channel(Directive::Run);
        let run = RelayRun {
            platform: Arc::clone(&self.platform),
            checkpoints: Arc::clone(&self.checkpoints),
            governor: self.governor,
            checkpoint_every: self.settings.checkpoint_every,
            source: source.clone(),
            target: target.clone(),
            directives: directives_rx,
            progress: Arc::clone(&self.progress),
            checkpoint: self.checkpoint,
        };
        self.runs.spawn(run.execute());
        self.directives = Some(directives);
        self.set_state(RunState::Running);

        info!(%source, %target, resume_after = ?self.checkpoint.last_id, "Relay started");
        Ok(ControlOutcome::Started {
            source,
            target,
            resume_after: self.checkpoint.last_id,
        })
    }

    fn pause(&mut self) -> ControlOutcome {
        match self.current_state() {
            RunState::Running => {
                self.direct(Directive::Pause);
                self.set_state(RunState::Paused);
                info!("Relay pause requested");
                ControlOutcome::Paused
            }
            RunState::Paused => ControlOutcome::AlreadyPaused,
            RunState::Idle | RunState::Stopping => ControlOutcome::NotRunning,
        }
    }

    fn resume(&mut self) -> ControlOutcome {
        match self.current_state() {
            RunState::Paused => {
                self.direct(Directive::Run);
                self.set_state(RunState::Running);
                info!("Relay resume requested");
                ControlOutcome::Resumed
            }
            RunState::Running => ControlOutcome::NotPaused,
            RunState::Idle | RunState::Stopping => ControlOutcome::NotRunning,
        }
    }

    fn stop(&mut self) -> ControlOutcome {
        match self.current_state() {
            RunState::Running | RunState::Paused => {
                self.direct(Directive::Stop);
                self.set_state(RunState::Stopping);
                info!("Relay stop requested");
                ControlOutcome::StopRequested
            }
            RunState::Stopping => ControlOutcome::StopRequested,
            RunState::Idle => ControlOutcome::NotRunning,
        }
    }

    async fn update_config(
        &mut self,
        change: impl FnOnce(&mut RelayConfig) + Send,
    ) -> Result<ControlOutcome, ControlError> {
        let mut updated = self.config.clone();
        change(&mut updated);
        self.configs.save(&updated).await?;

        info!(source = ?updated.source, target = ?updated.target, "Relay config updated");
        self.config = updated.clone();
        self.config_tx.send_replace(updated.clone());
        Ok(ControlOutcome::ConfigUpdated(updated))
    }

    async fn finish_run(&mut self, joined: Result<RunReport, JoinError>) {
        let end = match joined {
            Ok(report) => {
                self.checkpoint = report.checkpoint;
                info!(
                    end = %report.end,
                    forwarded = report.forwarded,
                    skipped = report.skipped,
                    total = report.checkpoint.count,
                    "Relay run ended"
                );
                report.end
            }
            Err(e) => {
                error!(error = %e, "Relay task crashed");
                let persisted = self.checkpoints.load().await;
                if persisted.count >= self.checkpoint.count {
                    self.checkpoint = persisted;
                }
                RunEnd::Failed(format!("relay task crashed: {e}"))
            }
        };

        let checkpoint = self.checkpoint;
        self.progress.send_modify(|p| {
            p.checkpoint = checkpoint;
            p.started_at = None;
            p.flood_until = None;
            p.resting_until = None;
            p.last_end = Some(end);
            p.finished_runs += 1;
        });
        self.directives = None;
        self.set_state(RunState::Idle);
    }

    async fn shutdown(&mut self) {
        if self.directives.is_some() {
            self.direct(Directive::Stop);
            self.set_state(RunState::Stopping);
        }
        while let Some(joined) = self.runs.join_next().await {
            self.finish_run(joined).await;
        }
        info!(
            last_id = ?self.checkpoint.last_id,
            count = self.checkpoint.count,
            "Forwarding controller stopped"
        );
    }

    fn snapshot(&self) -> StatusSnapshot {
        let progress = self.progress.borrow().clone();
        StatusSnapshot::compose(self.current_state(), &self.config, &progress, Utc::now())
    }

    fn current_state(&self) -> RunState {
        *self.state.borrow()
    }

    fn set_state(&self, state: RunState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Run state changed");
        }
    }

    fn direct(&self, directive: Directive) {
        if let Some(directives) = &self.directives {
            directives.send_replace(directive);
        }
    }
}

async fn seed_operator(
    config: &mut RelayConfig,
    settings: &ControllerSettings,
    configs: &dyn RelayConfigStore,
) {
    if config.admin.is_some() {
        return;
    }

    if let Some(operator) = settings.default_operator {
        config.admin = Some(operator);
        match configs.save(config).await {
            Ok(()) => info!(%operator, "Operator recorded from settings"),
            Err(e) => warn!(error = %e, "Failed to persist operator from settings"),
        }
    } else if settings.allow_open_control {
        warn!("No operator configured and open control is enabled: anyone can control the relay");
    } else {
        warn!("No operator configured: control commands will be refused until ADMIN is set");
    }
}

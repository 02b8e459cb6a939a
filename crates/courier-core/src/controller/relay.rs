//! The relay loop: one run from `start` until exhaustion, stop, or failure.

use super::status::{Progress, RunEnd};
use crate::governor::RateGovernor;
use crate::platform::{PlatformError, RelayPlatform, SourceMessage};
use crate::relay_config::ChannelRef;
use crate::storage::{Checkpoint, CheckpointStore};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, trace, warn};

/// Instruction from the controller to the relay loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Directive {
    Run,
    Pause,
    Stop,
}

/// Final state handed back to the controller when a run ends
#[derive(Debug, Clone)]
pub(crate) struct RunReport {
    pub(crate) checkpoint: Checkpoint,
    pub(crate) end: RunEnd,
    pub(crate) forwarded: u64,
    pub(crate) skipped: u64,
}

#[derive(Debug, Error)]
enum RunFailure {
    #[error("enumerating source failed: {0}")]
    Enumeration(#[from] PlatformError),
}

enum Delivery {
    Forwarded,
    Skipped,
    Stopped,
}

/// Everything one run needs, moved into the spawned task.
pub(crate) struct RelayRun {
    pub(crate) platform: Arc<dyn RelayPlatform>,
    pub(crate) checkpoints: Arc<dyn CheckpointStore>,
    pub(crate) governor: RateGovernor,
    pub(crate) checkpoint_every: u32,
    pub(crate) source: ChannelRef,
    pub(crate) target: ChannelRef,
    pub(crate) directives: watch::Receiver<Directive>,
    pub(crate) progress: Arc<watch::Sender<Progress>>,
    pub(crate) checkpoint: Checkpoint,
}

struct RunCounters {
    unsaved: u32,
    since_rest: u64,
    forwarded: u64,
    skipped: u64,
}

impl RelayRun {
    #[instrument(skip(self), fields(source = %self.source, target = %self.target))]
    pub(crate) async fn execute(mut self) -> RunReport {
        let started_at = Utc::now();
        let checkpoint = self.checkpoint;
        self.progress.send_modify(|p| {
            p.checkpoint = checkpoint;
            p.started_at = Some(started_at);
            p.flood_until = None;
            p.resting_until = None;
            p.skipped = 0;
        });
        info!(resume_after = ?checkpoint.last_id, count = checkpoint.count, "Relay run started");

        let mut counters = RunCounters {
            unsaved: 0,
            since_rest: 0,
            forwarded: 0,
            skipped: 0,
        };

        let end = match self.relay(&mut counters).await {
            Ok(end) => end,
            Err(e) => {
                error!(error = %e, "Relay run aborted");
                RunEnd::Failed(e.to_string())
            }
        };

        self.persist(&mut counters).await;
        info!(
            ?end,
            forwarded = counters.forwarded,
            skipped = counters.skipped,
            last_id = ?self.checkpoint.last_id,
            "Relay run finished"
        );

        RunReport {
            checkpoint: self.checkpoint,
            end,
            forwarded: counters.forwarded,
            skipped: counters.skipped,
        }
    }

    async fn relay(&mut self, counters: &mut RunCounters) -> Result<RunEnd, RunFailure> {
        let mut messages = self
            .platform
            .messages(&self.source, self.checkpoint.last_id)
            .await?;

        while let Some(next) = messages.next().await {
            if self.directive() == Directive::Stop {
                return Ok(RunEnd::Stopped);
            }
            let message = next?;
            if self.checkpoint.covers(message.id) {
                trace!(message_id = message.id, "Already relayed, skipping");
                continue;
            }

            match self.deliver(message, counters).await? {
                Delivery::Forwarded => {
                    if !self.pace(counters).await {
                        return Ok(RunEnd::Stopped);
                    }
                }
                Delivery::Skipped => {}
                Delivery::Stopped => return Ok(RunEnd::Stopped),
            }
        }

        Ok(RunEnd::Exhausted)
    }

    /// Forward one message, retrying it for as long as the platform rate-limits us.
    async fn deliver(
        &mut self,
        message: SourceMessage,
        counters: &mut RunCounters,
    ) -> Result<Delivery, RunFailure> {
        loop {
            if !self.wait_while_paused().await {
                return Ok(Delivery::Stopped);
            }

            let result = self
                .platform
                .forward(&self.source, &self.target, message)
                .await;
            match result {
                Ok(()) => {
                    self.record(message.id, counters).await;
                    return Ok(Delivery::Forwarded);
                }
                Err(PlatformError::RateLimited { wait }) => {
                    let backoff = self.governor.flood_backoff(wait);
                    warn!(
                        message_id = message.id,
                        wait_secs = wait.as_secs(),
                        backoff_secs = backoff.as_secs(),
                        "Rate limited by platform, backing off"
                    );
                    self.persist(counters).await;

                    let until = deadline(backoff);
                    self.progress.send_modify(|p| p.flood_until = until);
                    let completed = self.sleep_unless_stopped(backoff).await;
                    self.progress.send_modify(|p| p.flood_until = None);

                    if !completed {
                        return Ok(Delivery::Stopped);
                    }
                }
                Err(e) => {
                    counters.skipped += 1;
                    let skipped = counters.skipped;
                    self.progress.send_modify(|p| p.skipped = skipped);
                    warn!(message_id = message.id, error = %e, "Forward failed, skipping message");

                    if !self.sleep_unless_stopped(self.governor.error_pause()).await {
                        return Ok(Delivery::Stopped);
                    }
                    return Ok(Delivery::Skipped);
                }
            }
        }
    }

    async fn record(&mut self, ordinal: i64, counters: &mut RunCounters) {
        self.checkpoint.advance(ordinal);
        counters.forwarded += 1;
        counters.since_rest += 1;
        counters.unsaved += 1;

        let checkpoint = self.checkpoint;
        self.progress.send_modify(|p| p.checkpoint = checkpoint);
        debug!(message_id = ordinal, count = checkpoint.count, "Message forwarded");

        if counters.unsaved >= self.checkpoint_every {
            self.persist(counters).await;
        }
    }

    /// Sleep between forwards, resting when a batch is complete.
    /// Returns `false` when a stop arrived while waiting.
    async fn pace(&mut self, counters: &mut RunCounters) -> bool {
        if let Some(rest) = self.governor.batch_rest_due(counters.since_rest) {
            info!(
                forwarded = counters.since_rest,
                rest_secs = rest.as_secs(),
                "Batch complete, resting"
            );
            self.persist(counters).await;
            counters.since_rest = 0;

            let until = deadline(rest);
            self.progress.send_modify(|p| p.resting_until = until);
            let completed = self.sleep_unless_stopped(rest).await;
            self.progress.send_modify(|p| p.resting_until = None);

            if !completed {
                return false;
            }
        }

        self.sleep_unless_stopped(self.governor.forward_delay()).await
    }

    async fn persist(&self, counters: &mut RunCounters) {
        match self.checkpoints.save(&self.checkpoint).await {
            Ok(()) => {
                counters.unsaved = 0;
                trace!(last_id = ?self.checkpoint.last_id, count = self.checkpoint.count, "Checkpoint saved");
            }
            Err(e) => error!(error = %e, "Failed to save checkpoint"),
        }
    }

    fn directive(&self) -> Directive {
        *self.directives.borrow()
    }

    /// Block while paused. Returns `false` if a stop arrives first.
    async fn wait_while_paused(&mut self) -> bool {
        let mut announced = false;
        loop {
            let directive = *self.directives.borrow_and_update();
            match directive {
                Directive::Run => {
                    if announced {
                        info!("Relay resumed");
                    }
                    return true;
                }
                Directive::Stop => return false,
                Directive::Pause => {
                    if !announced {
                        info!("Relay paused");
                        announced = true;
                    }
                }
            }
            if self.directives.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Sleep for `duration`, waking early only for a stop.
    /// Returns `false` if the sleep was cut short.
    async fn sleep_unless_stopped(&mut self, duration: Duration) -> bool {
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);

        loop {
            let directive = *self.directives.borrow_and_update();
            if directive == Directive::Stop {
                return false;
            }
            tokio::select! {
                () = &mut sleep => return true,
                changed = self.directives.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}

fn deadline(wait: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(wait)
        .ok()
        .and_then(|wait| Utc::now().checked_add_signed(wait))
}

//! Run state and status snapshots shared with the control surface and health endpoint.

use crate::relay_config::{ChannelRef, RelayConfig};
use crate::storage::Checkpoint;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Lifecycle state of the forwarding controller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    /// No relay loop is active
    #[default]
    Idle,
    /// The relay loop is forwarding
    Running,
    /// The relay loop is parked before its next forward
    Paused,
    /// A stop was requested and the loop is winding down
    Stopping,
}

impl RunState {
    /// Whether a relay loop exists (running, paused or stopping).
    #[must_use]
    pub const fn is_active(self) -> bool {
        !matches!(self, Self::Idle)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
        })
    }
}

/// Why a run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "reason", rename_all = "lowercase")]
pub enum RunEnd {
    /// The source channel had nothing more to relay
    Exhausted,
    /// The operator stopped the run
    Stopped,
    /// The run hit an unrecoverable error
    Failed(String),
}

impl fmt::Display for RunEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted => f.write_str("source exhausted"),
            Self::Stopped => f.write_str("stopped by operator"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Live progress published by the relay loop
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    /// Current checkpoint, including forwards not yet persisted
    pub checkpoint: Checkpoint,
    /// When the active run started
    pub started_at: Option<DateTime<Utc>>,
    /// End of the rate-limit wait in progress
    pub flood_until: Option<DateTime<Utc>>,
    /// End of the batch rest in progress
    pub resting_until: Option<DateTime<Utc>>,
    /// Messages skipped in the active run after failed forwards
    pub skipped: u64,
    /// How the previous run ended
    pub last_end: Option<RunEnd>,
    /// Runs that ended since the controller started; bumped with `last_end`
    pub finished_runs: u64,
}

/// Point-in-time view of the relay for status and health reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    /// Controller state
    pub state: RunState,
    /// A relay loop is active and not paused
    pub running: bool,
    /// The relay loop is paused
    pub paused: bool,
    /// Total messages forwarded
    pub forwarded: u64,
    /// Ordinal of the last forwarded message
    pub last_id: Option<i64>,
    /// Messages skipped in the current run
    pub skipped: u64,
    /// Time since the current run started
    pub uptime_secs: Option<u64>,
    /// Configured source channel
    pub source: Option<ChannelRef>,
    /// Configured target channel
    pub target: Option<ChannelRef>,
    /// End of the rate-limit wait in progress
    pub flood_until: Option<DateTime<Utc>>,
    /// End of the batch rest in progress
    pub resting_until: Option<DateTime<Utc>>,
    /// How the previous run ended
    pub last_run: Option<RunEnd>,
}

impl StatusSnapshot {
    /// Combine controller state, configuration and loop progress.
    #[must_use]
    pub fn compose(
        state: RunState,
        config: &RelayConfig,
        progress: &Progress,
        now: DateTime<Utc>,
    ) -> Self {
        let uptime_secs = progress
            .started_at
            .filter(|_| state.is_active())
            .and_then(|started| (now - started).to_std().ok())
            .map(|elapsed| elapsed.as_secs());

        Self {
            state,
            running: matches!(state, RunState::Running | RunState::Stopping),
            paused: state == RunState::Paused,
            forwarded: progress.checkpoint.count,
            last_id: progress.checkpoint.last_id,
            skipped: progress.skipped,
            uptime_secs,
            source: config.source.clone(),
            target: config.target.clone(),
            flood_until: progress.flood_until,
            resting_until: progress.resting_until,
            last_run: progress.last_end.clone(),
        }
    }

    /// Uptime of the current run, if one is active.
    #[must_use]
    pub fn uptime(&self) -> Option<Duration> {
        self.uptime_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn test_uptime_only_while_active() {
        let now = Utc::now();
        let progress = Progress {
            started_at: Some(now - TimeDelta::seconds(90)),
            ..Progress::default()
        };

        let running =
            StatusSnapshot::compose(RunState::Running, &RelayConfig::default(), &progress, now);
        assert_eq!(running.uptime_secs, Some(90));
        assert!(running.running);
        assert!(!running.paused);

        let idle = StatusSnapshot::compose(RunState::Idle, &RelayConfig::default(), &progress, now);
        assert_eq!(idle.uptime_secs, None);
        assert!(!idle.running);
    }

    #[test]
    fn test_state_serializes_lowercase() {
        let value = serde_json::to_value(RunState::Paused).expect("serializable");
        assert_eq!(value, serde_json::json!("paused"));
    }
}

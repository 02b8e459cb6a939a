//! Configuration and settings management
//!
//! Relay pacing and file locations are loaded from configuration files and
//! environment variables. Every knob has a default.

use crate::controller::ControllerSettings;
use crate::governor::GovernorSettings;
use crate::relay_config::OperatorId;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Default delay between forwards (seconds)
pub const DEFAULT_FORWARD_DELAY_SECS: f64 = 1.2;
/// Default number of forwards between batch rests
pub const DEFAULT_BATCH_SIZE: u64 = 5000;
/// Default batch rest (minutes)
pub const DEFAULT_REST_MINUTES: u64 = 10;
/// Default number of forwards between checkpoint writes
pub const DEFAULT_CHECKPOINT_EVERY: u32 = 50;
/// Default margin added to platform rate-limit waits (seconds)
pub const DEFAULT_FLOOD_MARGIN_SECS: u64 = 1;
/// Default pause after a failed forward (seconds)
pub const DEFAULT_ERROR_PAUSE_SECS: f64 = 2.0;

/// Relay settings loaded from environment variables and config files
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RelaySettings {
    /// Delay between successful forwards, in seconds
    #[serde(default = "default_forward_delay_secs")]
    pub forward_delay_secs: f64,
    /// Forwards between batch rests (`0` disables resting)
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    /// Length of a batch rest, in minutes
    #[serde(default = "default_rest_minutes")]
    pub rest_minutes: u64,
    /// Forwards between checkpoint writes
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: u32,
    /// Seconds added to every platform rate-limit wait
    #[serde(default = "default_flood_margin_secs")]
    pub flood_margin_secs: u64,
    /// Pause after a failed forward, in seconds
    #[serde(default = "default_error_pause_secs")]
    pub error_pause_secs: f64,

    /// Path of the relay config document
    #[serde(default = "default_relay_config_path")]
    pub relay_config_path: PathBuf,
    /// Path of the progress document
    #[serde(default = "default_progress_path")]
    pub progress_path: PathBuf,

    /// Operator used when the relay config document has none
    pub admin: Option<String>,
    /// Let anyone control the relay while no operator is configured
    #[serde(default)]
    pub allow_open_control: bool,
}

const fn default_forward_delay_secs() -> f64 {
    DEFAULT_FORWARD_DELAY_SECS
}

const fn default_batch_size() -> u64 {
    DEFAULT_BATCH_SIZE
}

const fn default_rest_minutes() -> u64 {
    DEFAULT_REST_MINUTES
}

const fn default_checkpoint_every() -> u32 {
    DEFAULT_CHECKPOINT_EVERY
}

const fn default_flood_margin_secs() -> u64 {
    DEFAULT_FLOOD_MARGIN_SECS
}

const fn default_error_pause_secs() -> f64 {
    DEFAULT_ERROR_PAUSE_SECS
}

fn default_relay_config_path() -> PathBuf {
    PathBuf::from("relay_config.json")
}

fn default_progress_path() -> PathBuf {
    PathBuf::from("progress.json")
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            forward_delay_secs: DEFAULT_FORWARD_DELAY_SECS,
            batch_size: DEFAULT_BATCH_SIZE,
            rest_minutes: DEFAULT_REST_MINUTES,
            checkpoint_every: DEFAULT_CHECKPOINT_EVERY,
            flood_margin_secs: DEFAULT_FLOOD_MARGIN_SECS,
            error_pause_secs: DEFAULT_ERROR_PAUSE_SECS,
            relay_config_path: default_relay_config_path(),
            progress_path: default_progress_path(),
            admin: None,
            allow_open_control: false,
        }
    }
}

/// Build the layered configuration shared by every settings struct.
///
/// Sources, lowest priority first: `config/default`, `config/{RUN_MODE}`,
/// `config/local`, `APP__*` variables, then plain environment variables.
///
/// # Errors
///
/// Returns a `ConfigError` if a present source cannot be parsed.
pub fn build_config() -> Result<Config, ConfigError> {
    let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

    Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
        // Not checked into git
        .add_source(File::with_name("config/local").required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        // UPPER_SNAKE_CASE maps to snake_case keys; empty vars count as unset
        .add_source(Environment::default().ignore_empty(true))
        .build()
}

impl RelaySettings {
    /// Load settings from config files and the environment.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails.
    pub fn new() -> Result<Self, ConfigError> {
        build_config()?.try_deserialize()
    }

    /// Pacing for the rate governor.
    #[must_use]
    pub fn governor(&self) -> GovernorSettings {
        GovernorSettings {
            forward_delay: secs_f64_or(self.forward_delay_secs, DEFAULT_FORWARD_DELAY_SECS),
            batch_size: self.batch_size,
            batch_rest: Duration::from_secs(self.rest_minutes.saturating_mul(60)),
            flood_margin: Duration::from_secs(self.flood_margin_secs),
            error_pause: secs_f64_or(self.error_pause_secs, DEFAULT_ERROR_PAUSE_SECS),
        }
    }

    /// Settings for the forwarding controller.
    #[must_use]
    pub fn controller(&self) -> ControllerSettings {
        ControllerSettings {
            checkpoint_every: self.checkpoint_every.max(1),
            allow_open_control: self.allow_open_control,
            default_operator: self.default_operator(),
        }
    }

    /// The operator from `ADMIN`, if set and numeric.
    #[must_use]
    pub fn default_operator(&self) -> Option<OperatorId> {
        let raw = self.admin.as_deref()?;
        let parsed = OperatorId::parse(raw);
        if parsed.is_none() {
            warn!("Ignoring non-numeric ADMIN value {raw:?}");
        }
        parsed
    }
}

fn secs_f64_or(secs: f64, fallback: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or_else(|_| {
        warn!("Invalid duration {secs}s, using {fallback}s");
        Duration::from_secs_f64(fallback)
    })
}

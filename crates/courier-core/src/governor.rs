//! Pacing policy for the relay loop.
//!
//! The governor decides how long the loop waits; it never sleeps itself.

use std::time::Duration;

/// Static pacing configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GovernorSettings {
    /// Delay after every successful forward
    pub forward_delay: Duration,
    /// Forwards between batch rests, `0` disables resting
    pub batch_size: u64,
    /// Length of a batch rest
    pub batch_rest: Duration,
    /// Added on top of every platform-suggested wait
    pub flood_margin: Duration,
    /// Pause after a failed forward before moving on
    pub error_pause: Duration,
}

impl Default for GovernorSettings {
    fn default() -> Self {
        Self {
            forward_delay: Duration::from_millis(1200),
            batch_size: 5000,
            batch_rest: Duration::from_secs(10 * 60),
            flood_margin: Duration::from_secs(1),
            error_pause: Duration::from_secs(2),
        }
    }
}

/// Rate policy consulted by the relay loop on every iteration
#[derive(Debug, Clone, Copy, Default)]
pub struct RateGovernor {
    settings: GovernorSettings,
}

impl RateGovernor {
    /// Create a governor with the given pacing.
    #[must_use]
    pub const fn new(settings: GovernorSettings) -> Self {
        Self { settings }
    }

    /// Pacing configuration.
    #[must_use]
    pub const fn settings(&self) -> &GovernorSettings {
        &self.settings
    }

    /// Steady-state delay between forwards.
    #[must_use]
    pub const fn forward_delay(&self) -> Duration {
        self.settings.forward_delay
    }

    /// Pause after a forward that failed for a reason other than rate limiting.
    #[must_use]
    pub const fn error_pause(&self) -> Duration {
        self.settings.error_pause
    }

    /// Rest owed after `forwarded_since_rest` consecutive forwards, if any.
    ///
    /// # Examples
    ///
    /// ```
    /// use courier_core::governor::{GovernorSettings, RateGovernor};
    /// use std::time::Duration;
    ///
    /// let governor = RateGovernor::new(GovernorSettings {
    ///     batch_size: 3,
    ///     batch_rest: Duration::from_secs(60),
    ///     ..GovernorSettings::default()
    /// });
    /// assert_eq!(governor.batch_rest_due(2), None);
    /// assert_eq!(governor.batch_rest_due(3), Some(Duration::from_secs(60)));
    /// ```
    #[must_use]
    pub const fn batch_rest_due(&self, forwarded_since_rest: u64) -> Option<Duration> {
        if self.settings.batch_size == 0 || forwarded_since_rest < self.settings.batch_size {
            return None;
        }
        Some(self.settings.batch_rest)
    }

    /// Wait to apply after the platform signalled a rate limit.
    #[must_use]
    pub fn flood_backoff(&self, suggested: Duration) -> Duration {
        suggested.saturating_add(self.settings.flood_margin)
    }
}

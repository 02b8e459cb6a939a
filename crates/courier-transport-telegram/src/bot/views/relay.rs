//! Relay control UI components
//!
//! Contains the control keyboard, callback data, and HTML formatters for
//! command outcomes, status and configuration.

use chrono::{DateTime, Utc};
use courier_core::controller::{ControlCommand, ControlOutcome, RunEnd, StatusSnapshot};
use courier_core::error::ControlError;
use courier_core::relay_config::{ChannelRef, RelayConfig};
use std::time::Duration;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};

// ─────────────────────────────────────────────────────────────────────────────
// Callback constants
// ─────────────────────────────────────────────────────────────────────────────

/// Prefix shared by all control callbacks
pub const CALLBACK_PREFIX: &str = "relay:";
/// Callback data for starting the relay
pub const CALLBACK_START: &str = "relay:start";
/// Callback data for pausing the relay
pub const CALLBACK_PAUSE: &str = "relay:pause";
/// Callback data for resuming the relay
pub const CALLBACK_RESUME: &str = "relay:resume";
/// Callback data for stopping the relay
pub const CALLBACK_STOP: &str = "relay:stop";
/// Callback data for refreshing the status
pub const CALLBACK_STATUS: &str = "relay:status";

/// Reply for anyone who is not the operator
pub const ACCESS_DENIED: &str = "⛔️ Access denied";

/// Map callback data back to a control command.
#[must_use]
pub fn parse_callback(data: &str) -> Option<ControlCommand> {
    match data.strip_prefix(CALLBACK_PREFIX)? {
        "start" => Some(ControlCommand::Start),
        "pause" => Some(ControlCommand::Pause),
        "resume" => Some(ControlCommand::Resume),
        "stop" => Some(ControlCommand::Stop),
        "status" => Some(ControlCommand::Status),
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Keyboards
// ─────────────────────────────────────────────────────────────────────────────

/// Inline control panel
///
/// # Examples
///
/// ```
/// use courier_transport_telegram::bot::views::control_keyboard;
/// let keyboard = control_keyboard();
/// assert_eq!(keyboard.inline_keyboard.len(), 2);
/// ```
#[must_use]
pub fn control_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![
            InlineKeyboardButton::callback("▶️ Start", CALLBACK_START),
            InlineKeyboardButton::callback("⏸ Pause", CALLBACK_PAUSE),
            InlineKeyboardButton::callback("⏯ Resume", CALLBACK_RESUME),
        ],
        vec![
            InlineKeyboardButton::callback("⏹ Stop", CALLBACK_STOP),
            InlineKeyboardButton::callback("📊 Status", CALLBACK_STATUS),
        ],
    ])
}

// ─────────────────────────────────────────────────────────────────────────────
// Formatters
// ─────────────────────────────────────────────────────────────────────────────

/// HTML reply for an accepted control command.
#[must_use]
pub fn render_outcome(outcome: &ControlOutcome, now: DateTime<Utc>) -> String {
    match outcome {
        ControlOutcome::Started {
            source,
            target,
            resume_after,
        } => {
            let from = resume_after.map_or_else(
                || "Starting from the first message.".to_string(),
                |last| format!("Resuming after message #{last}."),
            );
            format!(
                "▶️ <b>Relay started</b>\nFrom: {}\nTo: {}\n{from}",
                channel(Some(source)),
                channel(Some(target))
            )
        }
        ControlOutcome::AlreadyRunning(state) => format!("ℹ️ Relay is already {state}."),
        ControlOutcome::StillStopping => {
            "⏳ The previous run is still stopping, try again in a moment.".to_string()
        }
        ControlOutcome::Paused => "⏸ Relay will pause before the next message.".to_string(),
        ControlOutcome::AlreadyPaused => "ℹ️ Relay is already paused.".to_string(),
        ControlOutcome::Resumed => "▶️ Relay resumed.".to_string(),
        ControlOutcome::NotPaused => "ℹ️ Relay is not paused.".to_string(),
        ControlOutcome::StopRequested => "⏹ Stopping relay. Progress is saved.".to_string(),
        ControlOutcome::NotRunning => "ℹ️ Relay is not running.".to_string(),
        ControlOutcome::Status(status) => render_status(status, now),
        ControlOutcome::ConfigUpdated(config) => format!(
            "✅ Config saved. Changes apply on the next start.\n\n{}",
            render_config(config)
        ),
        ControlOutcome::Config(config) => render_config(config),
    }
}

/// HTML status report.
#[must_use]
pub fn render_status(status: &StatusSnapshot, now: DateTime<Utc>) -> String {
    let mut lines = vec![
        "📊 <b>Relay status</b>".to_string(),
        format!("State: <b>{}</b>", status.state),
    ];

    lines.push(match status.last_id {
        Some(last) => format!("Forwarded: {} (last #{last})", status.forwarded),
        None => format!("Forwarded: {}", status.forwarded),
    });
    if status.skipped > 0 {
        lines.push(format!("Skipped this run: {}", status.skipped));
    }
    if let Some(uptime) = status.uptime() {
        lines.push(format!("Uptime: {}", format_duration(uptime)));
    }
    lines.push(format!("Source: {}", channel(status.source.as_ref())));
    lines.push(format!("Target: {}", channel(status.target.as_ref())));

    if let Some(left) = remaining(status.flood_until, now) {
        lines.push(format!("⏳ Flood wait: {} left", format_duration(left)));
    }
    if let Some(left) = remaining(status.resting_until, now) {
        lines.push(format!("😴 Batch rest: {} left", format_duration(left)));
    }
    if let Some(end) = &status.last_run {
        lines.push(format!("Last run: {}", escape(&end.to_string())));
    }

    lines.join("\n")
}

/// HTML view of the stored configuration.
#[must_use]
pub fn render_config(config: &RelayConfig) -> String {
    let operator = config
        .admin
        .map_or_else(|| "<i>not set</i>".to_string(), |id| format!("<code>{id}</code>"));
    format!(
        "⚙️ <b>Relay config</b>\nSource: {}\nTarget: {}\nOperator: {operator}",
        channel(config.source.as_ref()),
        channel(config.target.as_ref())
    )
}

/// HTML reply for a refused control command.
#[must_use]
pub fn render_error(error: &ControlError) -> String {
    match error {
        ControlError::Unauthorized(_) => ACCESS_DENIED.to_string(),
        ControlError::NotConfigured(missing) => format!(
            "⚠️ Set the {missing} channel first with /set_source and /set_target."
        ),
        ControlError::Storage(e) => {
            format!("❌ Could not save config: {}", escape(&e.to_string()))
        }
        ControlError::Unavailable => "❌ Relay controller is not running.".to_string(),
    }
}

/// HTML notice sent to the operator when a run ends.
#[must_use]
pub fn render_run_end(end: &RunEnd, status: &StatusSnapshot) -> String {
    let icon = match end {
        RunEnd::Exhausted => "🏁",
        RunEnd::Stopped => "⏹",
        RunEnd::Failed(_) => "❌",
    };
    let last = status
        .last_id
        .map_or_else(String::new, |last| format!(" (last #{last})"));
    format!(
        "{icon} <b>Relay run ended</b>: {}\nForwarded total: {}{last}",
        escape(&end.to_string()),
        status.forwarded
    )
}

/// Compact human-readable duration, e.g. `1h 02m 03s`.
///
/// # Examples
///
/// ```
/// use courier_transport_telegram::bot::views::format_duration;
/// use std::time::Duration;
///
/// assert_eq!(format_duration(Duration::from_secs(3723)), "1h 02m 03s");
/// assert_eq!(format_duration(Duration::from_secs(42)), "42s");
/// ```
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}h {minutes:02}m {seconds:02}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}

fn remaining(until: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<Duration> {
    until.and_then(|until| (until - now).to_std().ok())
}

fn channel(channel: Option<&ChannelRef>) -> String {
    channel.map_or_else(
        || "<i>not set</i>".to_string(),
        |c| format!("<code>{}</code>", escape(&c.to_string())),
    )
}

fn escape(text: &str) -> String {
    html_escape::encode_text(text).into_owned()
}

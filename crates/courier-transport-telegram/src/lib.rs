#![deny(missing_docs)]
//! Telegram transport adapter for the Courier relay.

/// Telegram-specific bot implementation.
pub mod bot;
/// Telegram transport configuration.
pub mod config;
/// HTTP health endpoint.
pub mod health;
/// `RelayPlatform` backed by the Bot API.
pub mod platform;
/// Telegram runtime entrypoint.
pub mod runner;

#![deny(missing_docs)]
//! Courier core library.
//!
//! Platform-independent relay logic: the forwarding controller, pacing,
//! checkpoints and the relay configuration.

/// Operator authorization.
pub mod auth;
/// Configuration management.
pub mod config;
/// Forwarding controller and relay loop.
pub mod controller;
/// Control errors.
pub mod error;
/// Forward pacing and backoff.
pub mod governor;
/// Messaging platform abstraction.
pub mod platform;
/// Source, target and operator configuration.
pub mod relay_config;
/// Checkpoint and config persistence.
pub mod storage;

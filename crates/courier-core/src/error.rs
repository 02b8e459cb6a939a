//! Errors returned by control operations.

use crate::relay_config::MissingChannel;
use crate::storage::StorageError;
use thiserror::Error;

/// Reasons a control command was refused
#[derive(Error, Debug)]
pub enum ControlError {
    /// The caller is not the configured operator
    #[error("user {0} is not allowed to control the relay")]
    Unauthorized(i64),
    /// The relay cannot start until both channels are set
    #[error("relay is not configured: {0} channel missing")]
    NotConfigured(MissingChannel),
    /// A configuration change could not be persisted
    #[error("failed to persist relay config: {0}")]
    Storage(#[from] StorageError),
    /// The controller task is no longer running
    #[error("forwarding controller is not available")]
    Unavailable,
}

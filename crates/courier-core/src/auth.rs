//! Operator gate for control commands.

use crate::error::ControlError;
use crate::relay_config::RelayConfig;

/// Check that `caller` may issue control commands.
///
/// Only the configured operator passes. With no operator configured every
/// caller is refused, unless `allow_open` explicitly opts into open control.
///
/// # Errors
///
/// Returns [`ControlError::Unauthorized`] when the caller is refused.
///
/// # Examples
///
/// ```
/// use courier_core::auth::authorize;
/// use courier_core::relay_config::{OperatorId, RelayConfig};
///
/// let config = RelayConfig { admin: Some(OperatorId::new(7)), ..RelayConfig::default() };
/// assert!(authorize(&config, false, 7).is_ok());
/// assert!(authorize(&config, true, 8).is_err());
/// assert!(authorize(&RelayConfig::default(), false, 8).is_err());
/// ```
pub fn authorize(config: &RelayConfig, allow_open: bool, caller: i64) -> Result<(), ControlError> {
    match config.admin {
        Some(admin) if admin.get() == caller => Ok(()),
        None if allow_open => Ok(()),
        _ => Err(ControlError::Unauthorized(caller)),
    }
}

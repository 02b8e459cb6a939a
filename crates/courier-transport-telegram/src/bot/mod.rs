/// Command, callback and channel-post handlers
pub mod handlers;
/// Resilient messaging with automatic retry for Telegram API operations
pub mod resilient;
/// Unauthorized access flood protection
pub mod unauthorized_cache;
/// View layer for UI components (keyboards, messages)
pub mod views;

pub use unauthorized_cache::UnauthorizedCache;

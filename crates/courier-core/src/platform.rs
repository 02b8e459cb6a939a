//! Messaging platform seam.
//!
//! The relay only needs two primitives from the platform: walk a channel's
//! messages oldest-first, and forward one message to another channel.

use crate::relay_config::ChannelRef;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by the messaging platform
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    /// The platform asked us to wait before the next request
    #[error("rate limited, retry after {}s", wait.as_secs())]
    RateLimited {
        /// Wait suggested by the platform
        wait: Duration,
    },
    /// The platform refused this particular request
    #[error("request rejected: {0}")]
    Rejected(String),
    /// The platform could not be reached or answered unexpectedly
    #[error("platform unavailable: {0}")]
    Unavailable(String),
}

/// A message in the source channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceMessage {
    /// Platform-assigned ordinal, increasing within the channel
    pub id: i64,
}

/// Stream of source messages in ascending ordinal order
pub type MessageStream = BoxStream<'static, Result<SourceMessage, PlatformError>>;

/// Interface the relay loop uses to talk to the messaging platform
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RelayPlatform: Send + Sync {
    /// Enumerate messages of `source` oldest-first, starting after `after`.
    ///
    /// Implementations may also yield ordinals `<= after`; the relay skips them.
    async fn messages(
        &self,
        source: &ChannelRef,
        after: Option<i64>,
    ) -> Result<MessageStream, PlatformError>;

    /// Forward a single message from `source` to `target`
    async fn forward(
        &self,
        source: &ChannelRef,
        target: &ChannelRef,
        message: SourceMessage,
    ) -> Result<(), PlatformError>;
}

//! Bot API implementation of the relay platform.
//!
//! The Bot API has no history listing, so a source channel is walked by
//! ordinal: every message ID from the checkpoint up to the highest ID the bot
//! has seen for that channel. Heads are learned from channel posts (the bot
//! must be an admin of the source) and from messages the operator forwards
//! out of the source channel.

use async_trait::async_trait;
use courier_core::platform::{MessageStream, PlatformError, RelayPlatform, SourceMessage};
use courier_core::relay_config::ChannelRef;
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use teloxide::prelude::*;
use teloxide::types::{MessageId, Recipient};
use teloxide::RequestError;
use tracing::{debug, trace};

/// Highest message ID seen per channel, keyed by chat ID and by handle.
#[derive(Debug, Default)]
pub struct SourceHeads {
    heads: Mutex<HashMap<String, i64>>,
}

impl SourceHeads {
    /// Record a message seen in a channel. Returns the channel's head afterwards.
    pub fn observe(&self, chat_id: i64, username: Option<&str>, message_id: i64) -> i64 {
        let mut heads = self.heads.lock().unwrap_or_else(PoisonError::into_inner);
        let mut keys = vec![ChannelRef::Id(chat_id).key()];
        if let Some(name) = username {
            keys.push(ChannelRef::Handle(name.to_string()).key());
        }

        let head = keys
            .iter()
            .filter_map(|key| heads.get(key).copied())
            .fold(message_id, i64::max);
        for key in keys {
            heads.insert(key, head);
        }
        trace!(chat_id, head, "Channel head observed");
        head
    }

    /// Highest message ID known for `channel`.
    #[must_use]
    pub fn head(&self, channel: &ChannelRef) -> Option<i64> {
        self.head_by_key(&channel.key())
    }

    fn head_by_key(&self, key: &str) -> Option<i64> {
        self.heads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }
}

/// Relay platform backed by a Telegram bot
#[derive(Clone)]
pub struct TelegramPlatform {
    bot: Bot,
    heads: Arc<SourceHeads>,
}

impl TelegramPlatform {
    /// Create a platform that forwards with `bot` and enumerates from `heads`.
    #[must_use]
    pub const fn new(bot: Bot, heads: Arc<SourceHeads>) -> Self {
        Self { bot, heads }
    }
}

#[async_trait]
impl RelayPlatform for TelegramPlatform {
    async fn messages(
        &self,
        source: &ChannelRef,
        after: Option<i64>,
    ) -> Result<MessageStream, PlatformError> {
        let key = source.key();
        let Some(head) = self.heads.head_by_key(&key) else {
            return Err(PlatformError::Unavailable(format!(
                "no messages seen from {source} yet; post in the channel or forward one of its messages to the bot"
            )));
        };

        let start = after.map_or(1, |last| last.saturating_add(1));
        debug!(%source, start, head, "Walking source channel by message ID");

        let heads = Arc::clone(&self.heads);
        let ordinals = stream::unfold(start, move |next| {
            let head = heads.head_by_key(&key);
            async move {
                let head = head?;
                (next <= head).then(|| (Ok(SourceMessage { id: next }), next + 1))
            }
        });
        Ok(ordinals.boxed())
    }

    async fn forward(
        &self,
        source: &ChannelRef,
        target: &ChannelRef,
        message: SourceMessage,
    ) -> Result<(), PlatformError> {
        let id = i32::try_from(message.id).map_err(|_| {
            PlatformError::Rejected(format!("message id {} is out of range", message.id))
        })?;

        self.bot
            .forward_message(recipient(target), recipient(source), MessageId(id))
            .await
            .map(|_| ())
            .map_err(classify)
    }
}

/// Bot API address of a channel.
#[must_use]
pub fn recipient(channel: &ChannelRef) -> Recipient {
    match channel {
        ChannelRef::Id(id) => Recipient::Id(ChatId(*id)),
        ChannelRef::Handle(handle) => Recipient::ChannelUsername(handle.clone()),
    }
}

/// Map a Bot API failure onto the relay's error model.
#[must_use]
pub fn classify(error: RequestError) -> PlatformError {
    match error {
        RequestError::RetryAfter(wait) => PlatformError::RateLimited {
            wait: wait.duration(),
        },
        e @ (RequestError::Network(_) | RequestError::Io(_)) => {
            PlatformError::Unavailable(e.to_string())
        }
        e => PlatformError::Rejected(e.to_string()),
    }
}

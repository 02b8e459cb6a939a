//! Resilient messaging utilities with automatic retry for Telegram API operations.
//!
//! Control-surface replies go through these wrappers so a transient network
//! failure does not swallow the operator's answer. Relay forwards never do:
//! their failures are handled by the relay loop itself.

use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::types::{ChatId, InlineKeyboardMarkup, Message, MessageId, ParseMode};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::{debug, warn};

/// Initial backoff between retries (milliseconds)
pub const TELEGRAM_API_INITIAL_BACKOFF_MS: u64 = 200;
/// Upper bound for a single backoff (milliseconds)
pub const TELEGRAM_API_MAX_BACKOFF_MS: u64 = 5_000;
/// Retries after the first attempt
pub const TELEGRAM_API_MAX_RETRIES: usize = 3;

/// Run a Telegram API operation with exponential backoff and jitter.
///
/// # Errors
///
/// Returns the last error once all retries are exhausted.
pub async fn retry_telegram_operation<F, Fut, T>(operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let retry_strategy = ExponentialBackoff::from_millis(TELEGRAM_API_INITIAL_BACKOFF_MS)
        .max_delay(Duration::from_millis(TELEGRAM_API_MAX_BACKOFF_MS))
        .map(jitter)
        .take(TELEGRAM_API_MAX_RETRIES);

    Retry::spawn(retry_strategy, operation).await.map_err(|e| {
        warn!(
            attempts = TELEGRAM_API_MAX_RETRIES + 1,
            error = %e,
            "Telegram API operation failed"
        );
        e
    })
}

/// Send an HTML message with automatic retry on network failures.
///
/// # Errors
///
/// Returns an error after all retries are exhausted.
pub async fn send_html_resilient(
    bot: &Bot,
    chat_id: ChatId,
    text: impl Into<String>,
    keyboard: Option<InlineKeyboardMarkup>,
) -> Result<Message> {
    let text = text.into();
    retry_telegram_operation(|| async {
        let mut req = bot
            .send_message(chat_id, text.clone())
            .parse_mode(ParseMode::Html);
        if let Some(markup) = keyboard.clone() {
            req = req.reply_markup(markup);
        }
        req.await
            .map_err(|e| anyhow::anyhow!("Telegram send error: {e}"))
    })
    .await
}

/// Replace the text (and keyboard) of a panel message.
///
/// Returns `false` when the edit could not be applied; the caller may then
/// send a fresh message instead.
pub async fn edit_panel_resilient(
    bot: &Bot,
    chat_id: ChatId,
    msg_id: MessageId,
    text: &str,
    keyboard: InlineKeyboardMarkup,
) -> bool {
    let result = retry_telegram_operation(|| async {
        let req = bot
            .edit_message_text(chat_id, msg_id, text)
            .parse_mode(ParseMode::Html)
            .reply_markup(keyboard.clone());
        match req.await {
            Ok(_) => Ok(true),
            Err(e) if e.to_string().contains("message is not modified") => Ok(true),
            Err(e) => Err(anyhow::anyhow!("Telegram edit error: {e}")),
        }
    })
    .await;

    match result {
        Ok(edited) => edited,
        Err(e) => {
            debug!(error = %e, "Panel edit skipped");
            false
        }
    }
}

use crate::bot::resilient::{edit_panel_resilient, send_html_resilient};
use crate::bot::views::{
    control_keyboard, parse_callback, render_error, render_outcome, render_status, ACCESS_DENIED,
};
use crate::bot::UnauthorizedCache;
use crate::platform::SourceHeads;
use anyhow::{anyhow, Result};
use chrono::Utc;
use courier_core::controller::{ControlCommand, ControllerHandle};
use courier_core::error::ControlError;
use courier_core::relay_config::ChannelRef;
use std::sync::Arc;
use teloxide::{
    prelude::*,
    types::{Chat, MessageOrigin},
    utils::command::BotCommands,
};
use tracing::{debug, error, info};

/// Safe extraction of user ID from a message.
/// Returns 0 if the user information is missing.
pub fn get_user_id_safe(msg: &Message) -> i64 {
    msg.from.as_ref().map_or(0, |u| u.id.0.cast_signed())
}

fn get_user_name(msg: &Message) -> String {
    msg.from.as_ref().map_or_else(
        || "Unknown".to_string(),
        |user| {
            user.username
                .clone()
                .unwrap_or_else(|| user.first_name.clone())
        },
    )
}

/// Supported commands for the bot
#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "snake_case", description = "Relay control commands:")]
pub enum Command {
    /// Start relaying from the checkpoint
    #[command(description = "start relaying from the last checkpoint.")]
    Start,
    /// Pause before the next message
    #[command(description = "pause before the next message.")]
    Pause,
    /// Continue a paused relay
    #[command(description = "resume a paused relay.")]
    Resume,
    /// Stop the active run
    #[command(description = "stop the relay and save progress.")]
    Stop,
    /// Show relay status
    #[command(description = "show relay status.")]
    Status,
    /// Set the source channel
    #[command(description = "set the source channel (ID or @handle).")]
    SetSource(String),
    /// Set the target channel
    #[command(description = "set the target channel (ID or @handle).")]
    SetTarget(String),
    /// Clear the source channel
    #[command(description = "clear the source channel.")]
    RemoveSource,
    /// Clear the target channel
    #[command(description = "clear the target channel.")]
    RemoveTarget,
    /// Show the stored configuration
    #[command(description = "show the relay config.")]
    ShowConfig,
    /// Show the inline control panel
    #[command(description = "show the control panel.")]
    Panel,
    /// Show this help
    #[command(description = "show this help.")]
    Help,
}

/// What a command asks the bot to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Forward to the controller
    Control(ControlCommand),
    /// Show the control panel
    Panel,
    /// Show the command list
    Help,
}

impl Command {
    /// Translate a parsed bot command.
    ///
    /// # Errors
    ///
    /// Returns a usage hint when a channel argument is blank.
    pub fn action(self) -> Result<Action, &'static str> {
        let control = match self {
            Self::Start => ControlCommand::Start,
            Self::Pause => ControlCommand::Pause,
            Self::Resume => ControlCommand::Resume,
            Self::Stop => ControlCommand::Stop,
            Self::Status => ControlCommand::Status,
            Self::SetSource(raw) => ControlCommand::SetSource(
                ChannelRef::parse(&raw).ok_or("Usage: /set_source <channel ID or @handle>")?,
            ),
            Self::SetTarget(raw) => ControlCommand::SetTarget(
                ChannelRef::parse(&raw).ok_or("Usage: /set_target <channel ID or @handle>")?,
            ),
            Self::RemoveSource => ControlCommand::RemoveSource,
            Self::RemoveTarget => ControlCommand::RemoveTarget,
            Self::ShowConfig => ControlCommand::ShowConfig,
            Self::Panel => return Ok(Action::Panel),
            Self::Help => return Ok(Action::Help),
        };
        Ok(Action::Control(control))
    }
}

/// Handle a bot command from any user.
///
/// # Errors
///
/// Returns an error if the reply cannot be delivered.
pub async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    controller: ControllerHandle,
    cache: Arc<UnauthorizedCache>,
) -> Result<()> {
    let caller = get_user_id_safe(&msg);
    let chat_id = msg.chat.id;

    let action = match cmd.action() {
        Ok(action) => action,
        Err(usage) => {
            if controller.authorize(caller).is_err() {
                return deny(&bot, &msg, &cache).await;
            }
            send_html_resilient(&bot, chat_id, usage, None).await?;
            return Ok(());
        }
    };

    match action {
        Action::Help => {
            send_html_resilient(&bot, chat_id, help_text(), None).await?;
        }
        Action::Panel => {
            if controller.authorize(caller).is_err() {
                return deny(&bot, &msg, &cache).await;
            }
            let text = render_status(&controller.snapshot(), Utc::now());
            send_html_resilient(&bot, chat_id, text, Some(control_keyboard())).await?;
        }
        Action::Control(command) => match controller.execute(caller, command).await {
            Ok(outcome) => {
                send_html_resilient(&bot, chat_id, render_outcome(&outcome, Utc::now()), None)
                    .await?;
            }
            Err(ControlError::Unauthorized(_)) => return deny(&bot, &msg, &cache).await,
            Err(e) => {
                send_html_resilient(&bot, chat_id, render_error(&e), None).await?;
            }
        },
    }
    Ok(())
}

/// Handle a press on the inline control panel.
///
/// # Errors
///
/// Returns an error if the callback has no originating chat.
pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    controller: ControllerHandle,
) -> Result<()> {
    let Some(command) = q.data.as_deref().and_then(parse_callback) else {
        return Ok(());
    };

    let caller = q.from.id.0.cast_signed();
    let (chat_id, panel_id) = q
        .message
        .as_ref()
        .map(|msg| (msg.chat().id, msg.id()))
        .ok_or_else(|| anyhow!("Callback message missing chat id"))?;

    let reply = match controller.execute(caller, command).await {
        Ok(outcome) => render_outcome(&outcome, Utc::now()),
        Err(ControlError::Unauthorized(_)) => {
            let _ = bot
                .answer_callback_query(q.id.clone())
                .text(ACCESS_DENIED)
                .await;
            return Ok(());
        }
        Err(e) => {
            let _ = bot.answer_callback_query(q.id.clone()).await;
            send_html_resilient(&bot, chat_id, render_error(&e), None).await?;
            return Ok(());
        }
    };
    let _ = bot.answer_callback_query(q.id.clone()).await;

    let panel = format!(
        "{reply}\n\n{}",
        render_status(&controller.snapshot(), Utc::now())
    );
    if !edit_panel_resilient(&bot, chat_id, panel_id, &panel, control_keyboard()).await {
        send_html_resilient(&bot, chat_id, panel, Some(control_keyboard())).await?;
    }
    Ok(())
}

/// Learn the head of a channel from one of its posts.
pub fn handle_channel_post(msg: &Message, heads: &SourceHeads) {
    let head = observe_chat(heads, &msg.chat, i64::from(msg.id.0));
    debug!(chat_id = msg.chat.id.0, head, "Channel post seen");
}

/// Learn a channel head from a message the operator forwarded out of it.
///
/// # Errors
///
/// Returns an error if the acknowledgement cannot be delivered.
pub async fn handle_forwarded(
    bot: Bot,
    msg: Message,
    controller: ControllerHandle,
    heads: Arc<SourceHeads>,
    cache: Arc<UnauthorizedCache>,
) -> Result<()> {
    let caller = get_user_id_safe(&msg);
    if controller.authorize(caller).is_err() {
        return deny(&bot, &msg, &cache).await;
    }

    let Some(MessageOrigin::Channel {
        chat, message_id, ..
    }) = msg.forward_origin()
    else {
        let text = "ℹ️ Forward a message from the source channel so I can see how far it goes.";
        send_html_resilient(&bot, msg.chat.id, text, None).await?;
        return Ok(());
    };

    let head = observe_chat(&heads, chat, i64::from(message_id.0));
    info!(chat_id = chat.id.0, head, "Channel head learned from forwarded message");

    let text = format!(
        "📌 Latest known message in <code>{}</code> is now #{head}.",
        html_escape::encode_text(&chat_label(chat))
    );
    send_html_resilient(&bot, msg.chat.id, text, None).await?;
    Ok(())
}

/// Reply to a non-command message.
///
/// # Errors
///
/// Returns an error if the reply cannot be delivered.
pub async fn handle_other_message(
    bot: Bot,
    msg: Message,
    controller: ControllerHandle,
    cache: Arc<UnauthorizedCache>,
) -> Result<()> {
    if controller.authorize(get_user_id_safe(&msg)).is_err() {
        return deny(&bot, &msg, &cache).await;
    }
    send_html_resilient(&bot, msg.chat.id, help_text(), None).await?;
    Ok(())
}

/// Send "Access denied" at most once per cooldown window.
///
/// # Errors
///
/// Never fails; delivery problems are logged.
pub async fn deny(bot: &Bot, msg: &Message, cache: &UnauthorizedCache) -> Result<()> {
    let user_id = get_user_id_safe(msg);
    let user_name = get_user_name(msg);

    if cache.should_send(user_id, &user_name).await {
        info!(user_id, user_name, "Unauthorized control attempt, sending denial");
        match bot.send_message(msg.chat.id, ACCESS_DENIED).await {
            Ok(_) => cache.mark_sent(user_id).await,
            Err(e) => error!(user_id, error = %e, "Failed to send access denied message"),
        }
    }
    Ok(())
}

fn help_text() -> String {
    html_escape::encode_text(&Command::descriptions().to_string()).into_owned()
}

fn observe_chat(heads: &SourceHeads, chat: &Chat, message_id: i64) -> i64 {
    heads.observe(chat.id.0, chat.username(), message_id)
}

fn chat_label(chat: &Chat) -> String {
    chat.username()
        .map_or_else(|| chat.id.0.to_string(), |name| format!("@{name}"))
}

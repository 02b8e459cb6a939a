use crate::bot;
use crate::bot::handlers::Command;
use crate::bot::resilient::send_html_resilient;
use crate::bot::views::render_run_end;
use crate::bot::UnauthorizedCache;
use crate::config::{
    get_unauthorized_cache_max_size, get_unauthorized_cache_ttl, get_unauthorized_cooldown,
    BotSettings,
};
use crate::health;
use crate::platform::{SourceHeads, TelegramPlatform};
use courier_core::controller::{ControllerHandle, ForwardingController, Progress, RunEnd};
use courier_core::governor::RateGovernor;
use courier_core::storage::{FileCheckpointStore, FileRelayConfigStore};
use std::sync::Arc;
use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use teloxide::types::CallbackQuery;
use teloxide::utils::command::BotCommands;
use tracing::{error, info, warn};

/// Run the Telegram transport runtime.
pub async fn run_bot(settings: Arc<BotSettings>) {
    let bot = Bot::new(settings.telegram.telegram_token.clone());
    let heads = Arc::new(SourceHeads::default());

    let controller = init_controller(&settings, bot.clone(), Arc::clone(&heads)).await;
    let health = spawn_health_endpoint(&settings, controller.clone());
    let notifier = tokio::spawn(notify_run_end(bot.clone(), controller.clone()));

    let unauthorized_cache = init_unauthorized_cache();
    let handler = setup_handler();

    if let Err(e) = bot.set_my_commands(Command::bot_commands()).await {
        warn!(error = %e, "Failed to register bot commands");
    }

    info!("Bot is running...");

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![
            controller.clone(),
            heads,
            unauthorized_cache
        ])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    info!("Dispatcher stopped, saving relay progress");
    controller.shutdown().await;
    notifier.abort();
    if let Some(health) = health {
        health.abort();
    }
}

async fn init_controller(
    settings: &BotSettings,
    bot: Bot,
    heads: Arc<SourceHeads>,
) -> ControllerHandle {
    let relay = settings.relay.as_ref();
    let checkpoints = Arc::new(FileCheckpointStore::new(relay.progress_path.clone()));
    let configs = Arc::new(FileRelayConfigStore::new(relay.relay_config_path.clone()));
    let platform = Arc::new(TelegramPlatform::new(bot, heads));
    let governor = RateGovernor::new(relay.governor());

    info!(
        progress = %relay.progress_path.display(),
        config = %relay.relay_config_path.display(),
        pacing = ?governor.settings(),
        "Initializing forwarding controller"
    );

    ForwardingController::spawn(platform, checkpoints, configs, governor, relay.controller()).await
}

fn spawn_health_endpoint(
    settings: &BotSettings,
    controller: ControllerHandle,
) -> Option<tokio::task::JoinHandle<()>> {
    let addr = match settings.telegram.health_addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!(
                addr = %settings.telegram.health_addr,
                error = %e,
                "Invalid HEALTH_ADDR, health endpoint disabled"
            );
            return None;
        }
    };

    Some(tokio::spawn(async move {
        if let Err(e) = health::serve(addr, controller).await {
            error!(error = %e, "Health endpoint stopped");
        }
    }))
}

fn init_unauthorized_cache() -> Arc<UnauthorizedCache> {
    let cooldown = get_unauthorized_cooldown();
    let ttl = get_unauthorized_cache_ttl();
    let max_size = get_unauthorized_cache_max_size();

    info!(
        cooldown_secs = cooldown,
        ttl_secs = ttl,
        max_size,
        "Initializing UnauthorizedCache"
    );

    Arc::new(UnauthorizedCache::new(cooldown, ttl, max_size))
}

/// Tell the operator whenever a run ends on its own or after a stop.
async fn notify_run_end(bot: Bot, controller: ControllerHandle) {
    let mut progress = controller.subscribe_progress();
    let mut seen = progress.borrow_and_update().finished_runs;

    while progress.changed().await.is_ok() {
        let finished = take_run_end(&mut seen, &progress.borrow_and_update());
        let Some(end) = finished else {
            continue;
        };
        let Some(operator) = controller.config().admin else {
            continue;
        };
        let text = render_run_end(&end, &controller.snapshot());
        if let Err(e) = send_html_resilient(&bot, ChatId(operator.get()), text, None).await {
            warn!(error = %e, "Failed to notify operator about run end");
        }
    }
}

/// The end of the latest run, if one finished since `seen` was last updated.
fn take_run_end(seen: &mut u64, progress: &Progress) -> Option<RunEnd> {
    if progress.finished_runs == *seen {
        return None;
    }
    *seen = progress.finished_runs;
    progress.last_end.clone()
}

fn setup_handler() -> UpdateHandler<teloxide::RequestError> {
    dptree::entry()
        .branch(Update::filter_channel_post().endpoint(handle_channel_post))
        .branch(Update::filter_callback_query().endpoint(handle_control_callback))
        .branch(
            Update::filter_message()
                .branch(
                    dptree::entry()
                        .filter_command::<Command>()
                        .endpoint(handle_command),
                )
                .branch(
                    dptree::filter(|msg: Message| msg.forward_origin().is_some())
                        .endpoint(handle_forwarded),
                )
                .branch(dptree::endpoint(handle_other_message)),
        )
}

async fn handle_channel_post(
    msg: Message,
    heads: Arc<SourceHeads>,
) -> Result<(), teloxide::RequestError> {
    bot::handlers::handle_channel_post(&msg, &heads);
    respond(())
}

async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    controller: ControllerHandle,
    cache: Arc<UnauthorizedCache>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = bot::handlers::handle_command(bot, msg, cmd, controller, cache).await {
        error!("Command error: {}", e);
    }
    respond(())
}

async fn handle_control_callback(
    bot: Bot,
    q: CallbackQuery,
    controller: ControllerHandle,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = bot::handlers::handle_callback(bot, q, controller).await {
        error!("Control callback handler error: {}", e);
    }
    respond(())
}

async fn handle_forwarded(
    bot: Bot,
    msg: Message,
    controller: ControllerHandle,
    heads: Arc<SourceHeads>,
    cache: Arc<UnauthorizedCache>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = bot::handlers::handle_forwarded(bot, msg, controller, heads, cache).await {
        error!("Forwarded message handler error: {}", e);
    }
    respond(())
}

async fn handle_other_message(
    bot: Bot,
    msg: Message,
    controller: ControllerHandle,
    cache: Arc<UnauthorizedCache>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = bot::handlers::handle_other_message(bot, msg, controller, cache).await {
        error!("Message handler error: {}", e);
    }
    respond(())
}

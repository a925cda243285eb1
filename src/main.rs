use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::ChatAction;
use teloxide::utils::command::BotCommands;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use relaybot::config::Config;
use relaybot::deepseek;
use relaybot::relay::{commands, Command, ContextOptions, Database, Invoker, NullStore, Pipeline, Store};

/// Sent when a handler fails on the store; the process keeps serving other chats.
const FAILURE_NOTICE: &str = "Ocorreu um erro ao processar sua mensagem. Tente novamente mais tarde.";

struct BotState {
    pipeline: Pipeline<deepseek::Client>,
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "relaybot.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    // Setup logging
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let log_file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("relaybot.log"))
    {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Failed to open log file: {e}");
            std::process::exit(1);
        }
    };
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .init();

    info!("🚀 Starting relaybot...");
    info!("Loaded config from {config_path}");

    let store: Arc<dyn Store> = if config.stateless {
        info!("Stateless mode: nothing will be persisted");
        Arc::new(NullStore)
    } else {
        match Database::open(&config.database_path(), config.bootstrap_moderator_id) {
            Ok(db) => Arc::new(db),
            Err(e) => {
                error!("Failed to open database: {e}");
                std::process::exit(1);
            }
        }
    };

    let client = deepseek::Client::new(
        config.deepseek_api_key.clone(),
        config.api_url.clone(),
        config.model.clone(),
    );
    let options = ContextOptions {
        history_limit: config.history_limit,
        persona_preamble: config.persona_preamble,
    };
    let state = Arc::new(BotState {
        pipeline: Pipeline::new(store, client, options),
    });

    let bot = Bot::new(&config.telegram_bot_token);
    if let Err(e) = bot.set_my_commands(Command::bot_commands()).await {
        warn!("Failed to register command list: {e}");
    }

    let handler = Update::filter_message()
        .branch(dptree::entry().filter_command::<Command>().endpoint(handle_command))
        .branch(dptree::endpoint(handle_text));

    info!("Bot is running...");
    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

fn invoker(msg: &Message) -> Option<Invoker> {
    let user = msg.from.as_ref()?;
    let username = user.username.as_deref().unwrap_or(&user.first_name).to_string();
    Some(Invoker {
        chat_id: msg.chat.id.0,
        user_id: user.id.0 as i64,
        username,
    })
}

async fn handle_command(bot: Bot, msg: Message, cmd: Command, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(from) = invoker(&msg) else {
        return Ok(());
    };

    info!("⌨️ {:?} from {} ({})", cmd, from.username, from.user_id);
    let reply = match commands::execute(&cmd, &from, state.pipeline.store().as_ref()) {
        Ok(reply) => reply,
        Err(e) => {
            error!("Command {:?} failed: {e}", cmd);
            FAILURE_NOTICE.to_string()
        }
    };

    if let Err(e) = bot.send_message(msg.chat.id, reply).await {
        warn!("Failed to send reply: {e}");
    }
    Ok(())
}

async fn handle_text(bot: Bot, msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    // Unknown commands are not relayed
    if text.starts_with('/') {
        return Ok(());
    }
    let Some(from) = invoker(&msg) else {
        return Ok(());
    };

    bot.send_chat_action(msg.chat.id, ChatAction::Typing).await.ok();

    let reply = match state
        .pipeline
        .handle_turn(from.chat_id, from.user_id, &from.username, text)
        .await
    {
        Ok(reply) => reply,
        Err(e) => {
            error!("Turn failed for chat {}: {e}", from.chat_id);
            FAILURE_NOTICE.to_string()
        }
    };

    if let Err(e) = bot.send_message(msg.chat.id, reply).await {
        warn!("Failed to send reply: {e}");
    }
    Ok(())
}

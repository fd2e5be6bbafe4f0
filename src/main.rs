mod audio;
mod classifier;
mod config;
mod dispatcher;
mod gate;
mod openai;
mod telegram;

use std::sync::Arc;
use std::time::Duration;

use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::ChatKind;
use teloxide::utils::command::BotCommands;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use classifier::{Fallbacks, LlmClassifier};
use config::Config;
use dispatcher::Dispatcher as TurnDispatcher;
use telegram::TelegramOutbox;

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase")]
enum Command {
    Start,
    Aboutme,
    Card,
}

struct BotState {
    turns: TurnDispatcher<LlmClassifier, TelegramOutbox>,
    outbox: TelegramOutbox,
    bot_username: Option<String>,
}

impl BotState {
    async fn new(config: &Config, bot: &Bot) -> Self {
        let client = openai::Client::new(
            config.openai_api_key.clone(),
            config.text_model.clone(),
            config.audio_model.clone(),
            Duration::from_secs(config.request_timeout_secs),
        );
        let llm = LlmClassifier::new(
            client,
            Fallbacks {
                card_image: config.fallback_card_image.clone(),
                meme_image: config.fallback_meme_image.clone(),
            },
        );

        let bot_username = match bot.get_me().await {
            Ok(me) => {
                info!("Bot user ID: {}, username: @{}", me.id, me.username());
                Some(me.username().to_string())
            }
            Err(e) => {
                warn!("Failed to get bot info: {e}");
                None
            }
        };

        Self {
            turns: TurnDispatcher::new(
                llm,
                TelegramOutbox::new(bot.clone()),
                config.timezone,
                config.card_media,
            ),
            outbox: TelegramOutbox::new(bot.clone()),
            bot_username,
        }
    }
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "gini.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let bot = Bot::new(&config.telegram_bot_token);

    // Setup logging
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("gini.log"))
        .expect("Failed to open log file");
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

    info!("🚀 Starting gini...");
    info!("Loaded config from {config_path}");
    match config.timezone {
        Some(tz) => info!("Reveal day evaluated in {tz}"),
        None => info!("Reveal day evaluated in host-local time"),
    }

    let state = Arc::new(BotState::new(&config, &bot).await);

    let handler = dptree::entry().branch(Update::filter_message().endpoint(handle_new_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

async fn handle_new_message(bot: Bot, msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    // Tarot readings are a one-on-one affair.
    if !matches!(msg.chat.kind, ChatKind::Private(_)) {
        return Ok(());
    }

    let user = match msg.from {
        Some(ref u) => u,
        None => return Ok(()),
    };
    let user_id = user.id.0 as i64;
    let username = user.username.as_deref().unwrap_or(&user.first_name);

    if let Some(voice) = msg.voice() {
        info!("🎙 Voice message from {username} ({user_id})");
        let file_id = voice.file.id.clone();
        let label = format!("{}.oga", file_id.0);

        let data = match download_voice(&bot, file_id).await {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to download voice from {username}: {e}");
                bot.send_message(msg.chat.id, dispatcher::AUDIO_ERROR).await.ok();
                return Ok(());
            }
        };

        state.turns.handle_voice(user_id, label, data).await;
        return Ok(());
    }

    let text = match msg.text() {
        Some(t) => t,
        None => return Ok(()),
    };

    if let Ok(cmd) = Command::parse(text, state.bot_username.as_deref().unwrap_or_default()) {
        match cmd {
            Command::Start => {
                info!("👋 /start from {username} ({user_id})");
                state.outbox.send_welcome(user_id, &user.first_name).await.ok();
            }
            Command::Aboutme => {
                state.outbox.send_about(user_id).await.ok();
            }
            Command::Card => {
                info!("🎴 /card from {username} ({user_id})");
                state.turns.handle_card_command(user_id).await;
            }
        }
        return Ok(());
    }

    let text_preview: String = text.chars().take(100).collect();
    info!("Message from {username} ({user_id}): \"{text_preview}\"");
    state.turns.handle_text(user_id, text).await;

    Ok(())
}

async fn download_voice(bot: &Bot, file_id: teloxide::types::FileId) -> Result<Vec<u8>, String> {
    let file = bot
        .get_file(file_id)
        .await
        .map_err(|e| format!("get_file failed: {e}"))?;

    let mut data = Vec::new();
    bot.download_file(&file.path, &mut data)
        .await
        .map_err(|e| format!("download failed: {e}"))?;

    Ok(data)
}

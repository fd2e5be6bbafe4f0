//! Telegram adapter using teloxide.

use teloxide::prelude::*;
use teloxide::types::{InputFile, KeyboardButton, KeyboardMarkup, ParseMode};
use tracing::warn;

use crate::dispatcher::Outbox;

const WELCOME_MESSAGE: &str = "<b>🌟 Hey {first_name}! 🌟</b>\n\n\
I am <b>Gini 🧞‍♀️</b>, your virtual assistant.\n\n\
<b>Commands 🧞‍♀️</b>\n\
🔮  /card - Your tarot card of the day\n\
🤖  /aboutme - Learn about me!";

const ABOUT_ME_TEXT: &str = "I am a Telegram bot developed by BT.\n\
I can read tarot cards and analyze your emotions from voice input.\n\
Email: <a href='mailto:supakavadee.r@gmail.com'>supakavadee.r@gmail.com</a>";

/// Sends rendered responses back to the originating user.
pub struct TelegramOutbox {
    bot: Bot,
}

impl TelegramOutbox {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    /// `/start` greeting with the command keyboard.
    pub async fn send_welcome(&self, user_id: i64, first_name: &str) -> Result<(), String> {
        let text = WELCOME_MESSAGE.replace("{first_name}", first_name);
        let keyboard = KeyboardMarkup::new(vec![
            vec![KeyboardButton::new("/card")],
            vec![KeyboardButton::new("/aboutme")],
        ])
        .resize_keyboard()
        .one_time_keyboard();

        self.bot
            .send_message(ChatId(user_id), text)
            .parse_mode(ParseMode::Html)
            .reply_markup(keyboard)
            .await
            .map(|_| ())
            .map_err(|e| {
                let msg = format!("Failed to send welcome: {e}");
                warn!("{}", msg);
                msg
            })
    }

    pub async fn send_about(&self, user_id: i64) -> Result<(), String> {
        self.bot
            .send_message(ChatId(user_id), ABOUT_ME_TEXT)
            .parse_mode(ParseMode::Html)
            .await
            .map(|_| ())
            .map_err(|e| {
                let msg = format!("Failed to send about: {e}");
                warn!("{}", msg);
                msg
            })
    }
}

impl Outbox for TelegramOutbox {
    async fn send_text(&self, user_id: i64, text: &str) -> Result<(), String> {
        // Plain text on purpose: classifier output may contain characters
        // that are not valid Telegram HTML.
        self.bot
            .send_message(ChatId(user_id), text)
            .await
            .map(|_| ())
            .map_err(|e| {
                let msg = format!("Failed to send: {e}");
                warn!("{}", msg);
                msg
            })
    }

    async fn send_photo(
        &self,
        user_id: i64,
        url: &str,
        caption: Option<&str>,
    ) -> Result<(), String> {
        let parsed = reqwest::Url::parse(url).map_err(|e| format!("Bad image URL '{url}': {e}"))?;
        let mut request = self.bot.send_photo(ChatId(user_id), InputFile::url(parsed));
        if let Some(cap) = caption {
            request = request.caption(cap);
        }

        request.await.map(|_| ()).map_err(|e| {
            let msg = format!("Failed to send photo: {e}");
            warn!("{}", msg);
            msg
        })
    }

    async fn send_animation(&self, user_id: i64, url: &str) -> Result<(), String> {
        let parsed =
            reqwest::Url::parse(url).map_err(|e| format!("Bad animation URL '{url}': {e}"))?;

        self.bot
            .send_animation(ChatId(user_id), InputFile::url(parsed))
            .await
            .map(|_| ())
            .map_err(|e| {
                let msg = format!("Failed to send animation: {e}");
                warn!("{}", msg);
                msg
            })
    }
}
